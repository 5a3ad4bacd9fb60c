pub mod http_log;
pub mod kube_forwarder;
pub mod mdns;

pub use http_log::LoggingHttpLogInterceptor;
pub use kube_forwarder::KubePortForwarder;
pub use mdns::{LoggingMdnsPublisher, MdnsPublisher};
