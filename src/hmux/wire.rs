//! HMUX framing primitives.
//!
//! # Responsibilities
//! - Write `(code, length, payload)` tuples with 2-byte big-endian lengths
//! - Read lengths, strings and raw payloads back
//! - Parse the 3-ASCII-digit status line
//!
//! All functions are generic over the stream so unit tests can run against
//! `tokio::io::duplex` instead of a real socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::hmux::codes;
use crate::hmux::HmuxError;

/// Write one framed tuple. The length prefix counts payload bytes, so
/// multi-byte UTF-8 strings must be passed as their byte representation.
/// Payloads over the 16-bit length limit are rejected before anything hits
/// the wire; a truncated prefix would desynchronize the whole stream.
pub async fn write_tuple<W>(w: &mut W, code: u8, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("tuple payload of {} bytes exceeds the 16-bit length prefix", payload.len()),
        )
    })?;

    w.write_u8(code).await?;
    w.write_u16(len).await?;
    w.write_all(payload).await
}

/// Write a string-valued tuple.
pub async fn write_string<W>(w: &mut W, code: u8, value: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_tuple(w, code, value.as_bytes()).await
}

/// Write a HEADER/STRING pair.
pub async fn write_header<W>(w: &mut W, name: &str, value: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_string(w, codes::HMUX_HEADER, name).await?;
    write_string(w, codes::HMUX_STRING, value).await
}

/// Write a bare control byte (ACK/QUIT/EXIT/YIELD).
pub async fn write_control<W>(w: &mut W, code: u8) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_u8(code).await
}

/// Read a 2-byte big-endian length prefix.
pub async fn read_length<R>(r: &mut R) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u16().await? as usize)
}

/// Read `len` payload bytes as a string.
pub async fn read_string<R>(r: &mut R, len: usize) -> Result<String, HmuxError>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(String::new());
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    String::from_utf8(buf).map_err(|_| HmuxError::Protocol("non-UTF-8 string payload".into()))
}

/// Read and discard `len` payload bytes.
pub async fn skip<R>(r: &mut R, len: usize) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = len;
    let mut junk = [0u8; 512];

    while remaining > 0 {
        let chunk = remaining.min(junk.len());
        r.read_exact(&mut junk[..chunk]).await?;
        remaining -= chunk;
    }

    Ok(())
}

/// Parse a status line of exactly 3 ASCII digits by summing digit values.
/// Anything else is a protocol error, not a lenient integer parse.
pub fn parse_status(status: &str) -> Result<u16, HmuxError> {
    let bytes = status.as_bytes();

    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(HmuxError::Protocol(format!("malformed status line '{status}'")));
    }

    let mut code = 0u16;
    for b in &bytes[..3] {
        code = 10 * code + u16::from(b - b'0');
    }

    Ok(code)
}
