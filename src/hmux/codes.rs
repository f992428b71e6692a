//! HMUX protocol byte codes.
//!
//! Every frame on the wire is `[1-byte code][2-byte big-endian length][payload]`,
//! except for the control codes [`HMUX_ACK`], [`HMUX_QUIT`], [`HMUX_EXIT`] and
//! [`HMUX_YIELD`], which carry no length or payload.

pub const HMUX_CHANNEL: u8 = b'C';
pub const HMUX_ACK: u8 = b'A';
pub const HMUX_ERROR: u8 = b'E';
pub const HMUX_YIELD: u8 = b'Y';
pub const HMUX_QUIT: u8 = b'Q';
pub const HMUX_EXIT: u8 = b'X';

pub const HMUX_DATA: u8 = b'D';
pub const HMUX_URI: u8 = b'U';
pub const HMUX_STRING: u8 = b'S';
pub const HMUX_HEADER: u8 = b'H';
pub const HMUX_BINARY: u8 = b'B';
pub const HMUX_PROTOCOL: u8 = b'P';
pub const HMUX_META_HEADER: u8 = b'M';

// Single-character field tags ('?', 'b'..'v').
pub const CSE_NULL: u8 = b'?';
pub const CSE_PATH_INFO: u8 = b'b';
pub const CSE_PROTOCOL: u8 = b'c';
pub const CSE_REMOTE_USER: u8 = b'd';
pub const CSE_QUERY_STRING: u8 = b'e';
pub const HMUX_FLUSH: u8 = b'f';
pub const CSE_SERVER_PORT: u8 = b'g';
pub const CSE_REMOTE_HOST: u8 = b'h';
pub const CSE_REMOTE_ADDR: u8 = b'i';
pub const CSE_REMOTE_PORT: u8 = b'j';
pub const CSE_REAL_PATH: u8 = b'k';
pub const CSE_SCRIPT_FILENAME: u8 = b'l';
pub const HMUX_METHOD: u8 = b'm';
pub const CSE_AUTH_TYPE: u8 = b'n';
pub const CSE_URI: u8 = b'o';
pub const CSE_CONTENT_LENGTH: u8 = b'p';
pub const CSE_CONTENT_TYPE: u8 = b'q';
pub const CSE_IS_SECURE: u8 = b'r';
pub const HMUX_STATUS: u8 = b's';
pub const CSE_CLIENT_CERT: u8 = b't';
pub const CSE_SERVER_TYPE: u8 = b'u';
pub const HMUX_SERVER_NAME: u8 = b'v';
