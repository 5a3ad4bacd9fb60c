use kforward_commons::{Forward, ForwardStatus};

/// The narrow capability the Manager needs from whatever consumes status. Implemented by an
/// external UI (e.g. a TUI); the control plane never assumes anything about the consumer beyond
/// this trait.
pub trait StatusUpdater: Send + Sync {
    fn add_forward(&self, id: &str, forward: &Forward);
    fn update_status(&self, id: &str, status: &ForwardStatus);
    fn remove(&self, id: &str);
}

/// `set_error` is an additional capability, not every `StatusUpdater` need support it — kept as
/// a separate extension trait rather than a default method on `StatusUpdater` so callers can
/// `downcast`/opt-in rather than being forced to implement a no-op.
pub trait ErrorReportingStatusUpdater: StatusUpdater {
    fn set_error(&self, id: &str, message: &str);
}

/// A `StatusUpdater` that only logs; used in tests and as the default when no richer UI is
/// wired in.
pub struct LoggingStatusUpdater;

impl StatusUpdater for LoggingStatusUpdater {
    fn add_forward(&self, id: &str, forward: &Forward) {
        log::info!("forward added: {id} -> local:{}", forward.local_port);
    }

    fn update_status(&self, id: &str, status: &ForwardStatus) {
        log::info!("forward {id} status: {}", status.label());
    }

    fn remove(&self, id: &str) {
        log::info!("forward removed: {id}");
    }
}

impl ErrorReportingStatusUpdater for LoggingStatusUpdater {
    fn set_error(&self, id: &str, message: &str) {
        log::error!("forward {id} error: {message}");
    }
}
