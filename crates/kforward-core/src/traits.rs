use async_trait::async_trait;
use kforward_commons::ResourceRef;
use tokio_util::sync::CancellationToken;

/// Everything `PortForwarder::forward` needs to run one connection attempt. Owns its fields
/// (rather than borrowing from the Worker) so a request can be handed to a dedicated
/// `tokio::spawn`ed task.
pub struct ForwardRequest {
    pub context: String,
    pub namespace: String,
    pub resource: ResourceRef,
    pub local_port: u16,
    pub remote_port: u16,
    /// Cancelled to stop this specific attempt (not the whole Worker).
    pub stop: CancellationToken,
    /// Fired once by the implementation when the local port is accepting connections.
    pub ready: tokio::sync::oneshot::Sender<()>,
}

/// The external tunnel transport, implemented by a real Kubernetes-backed collaborator in
/// `kforward-transport` and consumed here only through this trait.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Resolves a Forward's resource reference to a concrete endpoint identity (e.g. a pod
    /// name). A changed identity between calls signals a remote restart to the Worker.
    async fn get_pod_for_resource(
        &self,
        context: &str,
        namespace: &str,
        resource: &ResourceRef,
    ) -> Result<String, kforward_commons::Error>;

    /// Runs the tunnel for one connection attempt. Must resolve once the local port is
    /// accepting connections and return once `req.stop` is cancelled or the tunnel fails.
    async fn forward(&self, req: ForwardRequest) -> Result<(), kforward_commons::Error>;
}

/// Pull-based liveness contract the Watchdog polls.
pub trait HeartbeatResponder: Send + Sync {
    fn is_alive(&self) -> bool;
    fn forward_id(&self) -> &str;
}

/// Observes connection-level events on an `http_log`-enabled Forward's user-facing reverse
/// proxy. The boundary lives here so `Worker` can depend on it without depending on
/// `kforward-transport`; the real (log-based) implementation is built there.
pub trait HttpLogInterceptor: Send + Sync {
    fn on_connection_opened(&self, forward_id: &str, peer: std::net::SocketAddr);
    fn on_connection_closed(&self, forward_id: &str, bytes_sent: u64, bytes_received: u64);
}

/// The default `HttpLogInterceptor` for Forwards that don't ask for `http_log`. Worker still
/// needs an interceptor reference to pass to the reverse proxy when it is enabled per-Forward, so
/// this is what `Manager` wires in unless the caller supplies a real one.
pub struct NoopHttpLogInterceptor;

impl HttpLogInterceptor for NoopHttpLogInterceptor {
    fn on_connection_opened(&self, _forward_id: &str, _peer: std::net::SocketAddr) {}
    fn on_connection_closed(&self, _forward_id: &str, _bytes_sent: u64, _bytes_received: u64) {}
}

/// Announces (or withdraws) a Forward's local port on the network. The boundary lives here, next
/// to `HttpLogInterceptor`, so `Manager` can call it on Worker start/stop without depending on
/// `kforward-transport`'s real implementation.
pub trait MdnsPublisher: Send + Sync {
    fn publish(&self, forward_id: &str, local_port: u16, alias: Option<&str>);
    fn withdraw(&self, forward_id: &str);
}

/// The default `MdnsPublisher` when `mdns.enabled` is false or the caller supplies no richer one.
pub struct NoopMdnsPublisher;

impl MdnsPublisher for NoopMdnsPublisher {
    fn publish(&self, _forward_id: &str, _local_port: u16, _alias: Option<&str>) {}
    fn withdraw(&self, _forward_id: &str) {}
}
