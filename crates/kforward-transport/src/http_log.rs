//! A `Forward` can ask for `http_log: true` without capturing full request/response bodies to
//! disk — this module gives `HttpLogInterceptor` a default implementation that logs connection
//! boundaries through the ordinary `log` facade instead. The Worker's own reverse proxy is what
//! actually calls this on each connection's open/close.

use kforward_core::traits::HttpLogInterceptor;

/// Logs connection boundaries at `info` level. No body capture, no on-disk log files.
pub struct LoggingHttpLogInterceptor;

impl HttpLogInterceptor for LoggingHttpLogInterceptor {
    fn on_connection_opened(&self, forward_id: &str, peer: std::net::SocketAddr) {
        log::info!("forward {forward_id}: connection opened from {peer}");
    }

    fn on_connection_closed(&self, forward_id: &str, bytes_sent: u64, bytes_received: u64) {
        log::info!(
            "forward {forward_id}: connection closed (sent {bytes_sent}B, received {bytes_received}B)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_interceptor_does_not_panic() {
        let interceptor = LoggingHttpLogInterceptor;
        interceptor.on_connection_opened("dev/default/pod/app:80", ([127, 0, 0, 1], 9000).into());
        interceptor.on_connection_closed("dev/default/pod/app:80", 128, 256);
    }
}
