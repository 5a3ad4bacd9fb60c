use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;

/// The kind of workload a Forward resolves against: an explicit name or a label-driven lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRef {
    Pod { name: String },
    Service { name: String },
    PodSelector { selector: String },
}

impl ResourceRef {
    pub fn as_canonical(&self) -> String {
        match self {
            ResourceRef::Pod { name } => format!("pod/{name}"),
            ResourceRef::Service { name } => format!("service/{name}"),
            ResourceRef::PodSelector { selector } => format!("pod?{selector}"),
        }
    }
}

/// Only TCP is accepted; the variant exists so the YAML shape can reject anything else with a
/// clear error rather than silently defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

/// One intended tunnel from a local TCP port to a remote port on a Kubernetes workload.
///
/// Identity is `(context, namespace, resource_ref, remote_port, local_port)`; the canonical id
/// is `"<context>/<namespace>/<resource_ref>:<remote_port>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub context: String,
    pub namespace: String,
    pub resource: ResourceRef,
    pub protocol: Protocol,
    pub remote_port: u16,
    pub local_port: u16,
    pub alias: Option<String>,
    pub http_log: bool,
}

impl Forward {
    pub fn id(&self) -> String {
        format!(
            "{}/{}/{}:{}",
            self.context,
            self.namespace,
            self.resource.as_canonical(),
            self.remote_port
        )
    }

    /// Validates the invariants that apply to a single Forward in isolation (cross-forward
    /// invariants, such as local port uniqueness, are Manager's responsibility).
    pub fn validate(&self) -> Result<(), Error> {
        if self.remote_port == 0 {
            return Err(Error::InvalidConfig(format!(
                "forward {}: remote_port must be in 1..=65535",
                self.id()
            )));
        }
        if self.local_port == 0 {
            return Err(Error::InvalidConfig(format!(
                "forward {}: local_port must be in 1..=65535",
                self.id()
            )));
        }
        if let ResourceRef::PodSelector { selector } = &self.resource {
            if selector.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "forward {}: pod selector must be non-empty",
                    self.id()
                )));
            }
        }
        Ok(())
    }
}
