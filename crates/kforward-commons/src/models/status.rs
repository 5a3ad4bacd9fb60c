use serde::Serialize;

/// The single status a Forward occupies at any moment, mirrored on the EventBus and delivered
/// through `StatusUpdater`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ForwardStatus {
    Starting,
    Active,
    Reconnecting,
    Error { message: String },
    Stale,
}

impl ForwardStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ForwardStatus::Starting => "starting",
            ForwardStatus::Active => "active",
            ForwardStatus::Reconnecting => "reconnecting",
            ForwardStatus::Error { .. } => "error",
            ForwardStatus::Stale => "stale",
        }
    }
}
