//! Announces a Forward's local port over mDNS so other processes on the LAN can find it by name
//! instead of a hardcoded port. `Manager` calls `MdnsPublisher` best-effort on Worker start/stop
//! when `mdns.enabled` is set. No multicast responder ships here — wiring a real one is left to
//! the embedding application.

pub use kforward_core::traits::MdnsPublisher;

/// Records publish/withdraw calls through `log` instead of touching the network. The correct
/// default until a real responder is wired in by the embedding application.
pub struct LoggingMdnsPublisher;

impl MdnsPublisher for LoggingMdnsPublisher {
    fn publish(&self, forward_id: &str, local_port: u16, alias: Option<&str>) {
        match alias {
            Some(alias) => log::info!(
                "forward {forward_id}: would publish {alias}.local -> 127.0.0.1:{local_port}"
            ),
            None => {
                log::info!("forward {forward_id}: would publish 127.0.0.1:{local_port} over mDNS")
            }
        }
    }

    fn withdraw(&self, forward_id: &str) {
        log::info!("forward {forward_id}: would withdraw mDNS announcement");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_publisher_does_not_panic() {
        let publisher = LoggingMdnsPublisher;
        publisher.publish("dev/default/pod/app:80", 8080, Some("app"));
        publisher.publish("dev/default/pod/app:80", 8080, None);
        publisher.withdraw("dev/default/pod/app:80");
    }
}
