//! HTML diagnostics page.
//!
//! Served on the configured status path: one row per backend with its
//! health and pool counters, followed by the effective connector settings.

use std::fmt::Write;
use std::time::Duration;

use axum::extract::State;
use axum::response::Html;

use crate::proxy::handler::AppState;

pub async fn status_page(State(state): State<AppState>) -> Html<String> {
    let mut page = String::new();

    let _ = write!(
        page,
        "<html><head><title>Status : Hyper HMUX Connector</title></head>\n\
         <body>\n\
         <h1>Status : Hyper HMUX Connector</h1>\n"
    );

    let _ = write!(
        page,
        "<table border='2'>\n\
         <tr><th>Backend</th><th>State</th><th>Active</th><th>Pooled</th><th>CPU Load</th></tr>\n"
    );

    for server in state.balancer.servers() {
        let up = server.is_active();

        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.3}</td></tr>\n",
            server.name(),
            if up { "Up" } else { "Down" },
            server.active_count(),
            server.pooled_count(),
            server.cpu_load(),
        );
    }

    let _ = write!(page, "</table>\n");

    let settings = &state.settings;
    let _ = write!(
        page,
        "<h2>Configuration</h2>\n\
         <table border='2'>\n\
         <tr><td>Connect Timeout</td><td>{}</td></tr>\n\
         <tr><td>Idle Time</td><td>{}</td></tr>\n\
         <tr><td>Recover Time</td><td>{}</td></tr>\n\
         <tr><td>Socket Timeout</td><td>{}</td></tr>\n\
         <tr><td>Keepalive Timeout</td><td>{}</td></tr>\n\
         <tr><td>Max Connections</td><td>{}</td></tr>\n\
         <tr><td>Sticky Sessions</td><td>{}</td></tr>\n\
         </table>\n\
         </body></html>\n",
        format_time(settings.connect_timeout),
        format_time(settings.idle_time),
        format_time(settings.recover_time),
        format_time(settings.socket_timeout),
        format_time(settings.keepalive_timeout),
        settings.max_connections,
        settings.sticky_sessions,
    );

    Html(page)
}

/// Whole seconds print as seconds, everything else as milliseconds.
fn format_time(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{} sec.", d.as_secs())
    } else {
        format!("{} ms.", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_render_in_the_largest_clean_unit() {
        assert_eq!(format_time(Duration::from_secs(65)), "65 sec.");
        assert_eq!(format_time(Duration::from_millis(1500)), "1500 ms.");
        assert_eq!(format_time(Duration::from_millis(250)), "250 ms.");
    }
}
