pub mod backoff;
pub mod event_bus;
pub mod health_checker;
pub mod http_proxy;
pub mod manager;
pub mod port_checker;
pub mod signal;
pub mod status_updater;
pub mod traits;
pub mod watchdog;
pub mod worker;

pub use backoff::Backoff;
pub use event_bus::{Event, EventBus, Topic};
pub use health_checker::{HealthChecker, PortHealth, ProbeMethod};
pub use manager::Manager;
pub use port_checker::{DefaultPortChecker, PortChecker};
pub use signal::Signal;
pub use status_updater::StatusUpdater;
pub use traits::{
    ForwardRequest, HeartbeatResponder, HttpLogInterceptor, MdnsPublisher, NoopHttpLogInterceptor,
    NoopMdnsPublisher, PortForwarder,
};
pub use watchdog::Watchdog;
pub use worker::Worker;
