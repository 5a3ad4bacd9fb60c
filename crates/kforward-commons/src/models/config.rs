use std::time::Duration;

use serde::de::Error as DeError;
use serde::Deserialize;
use serde::Deserializer;

use crate::error::Error;
use crate::models::forward::{Forward, Protocol, ResourceRef};

/// Parses a decimal-with-unit duration string (`"5s"`, `"20m"`, `"1h"`, `"500ms"`).
pub fn parse_duration(raw: &str) -> Result<Duration, Error> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| Error::InvalidConfig(format!("duration '{raw}' has no unit")))?;
    let (value, unit) = raw.split_at(split_at);
    let value: f64 = value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("duration '{raw}' has no numeric value")))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(Error::InvalidConfig(format!(
                "duration '{raw}' has unknown unit '{other}'"
            )))
        }
    };
    Ok(Duration::from_secs_f64(secs.max(0.0)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(DeError::custom)
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|r| parse_duration(&r).map_err(DeError::custom))
        .transpose()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMethod {
    TcpDial,
    DataTransfer,
}

impl Default for ProbeMethod {
    fn default() -> Self {
        ProbeMethod::TcpDial
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthCheckConfig {
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub timeout: Option<Duration>,
    pub method: ProbeMethod,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub max_connection_age: Option<Duration>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub max_idle_time: Option<Duration>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            interval: None,
            timeout: None,
            method: ProbeMethod::default(),
            max_connection_age: None,
            max_idle_time: None,
        }
    }
}

impl HealthCheckConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_CONNECTION_AGE: Duration = Duration::ZERO;
    pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::ZERO;

    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(Self::DEFAULT_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    pub fn max_connection_age(&self) -> Duration {
        self.max_connection_age.unwrap_or(Self::DEFAULT_MAX_CONNECTION_AGE)
    }

    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time.unwrap_or(Self::DEFAULT_MAX_IDLE_TIME)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReliabilityConfig {
    pub tcp_keepalive: Option<bool>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub dial_timeout: Option<Duration>,
    pub retry_on_stale: Option<bool>,
    #[serde(deserialize_with = "deserialize_duration_opt")]
    pub watchdog_period: Option<Duration>,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            tcp_keepalive: None,
            dial_timeout: None,
            retry_on_stale: None,
            watchdog_period: None,
        }
    }
}

impl ReliabilityConfig {
    pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(15);
    pub const DEFAULT_HANG_THRESHOLD: Duration = Duration::from_secs(45);

    pub fn tcp_keepalive(&self) -> bool {
        self.tcp_keepalive.unwrap_or(true)
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout.unwrap_or(Self::DEFAULT_DIAL_TIMEOUT)
    }

    pub fn retry_on_stale(&self) -> bool {
        self.retry_on_stale.unwrap_or(true)
    }

    pub fn watchdog_period(&self) -> Duration {
        self.watchdog_period.unwrap_or(Self::DEFAULT_WATCHDOG_PERIOD)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct MdnsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardSpec {
    pub resource: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    pub local_port: u16,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub http_log: bool,
}

impl ForwardSpec {
    fn into_forward(self, context: &str, namespace: &str) -> Result<Forward, Error> {
        let resource = parse_resource_ref(&self.resource, self.selector.as_deref())?;
        let forward = Forward {
            context: context.to_string(),
            namespace: namespace.to_string(),
            resource,
            protocol: self.protocol,
            remote_port: self.port,
            local_port: self.local_port,
            alias: self.alias,
            http_log: self.http_log,
        };
        forward.validate()?;
        Ok(forward)
    }
}

fn parse_resource_ref(raw: &str, selector: Option<&str>) -> Result<ResourceRef, Error> {
    if let Some(name) = raw.strip_prefix("pod/") {
        if !name.is_empty() {
            if selector.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "resource '{raw}' names a pod directly; selector must be empty"
                )));
            }
            return Ok(ResourceRef::Pod { name: name.to_string() });
        }
    }
    if let Some(name) = raw.strip_prefix("service/") {
        if selector.is_some() {
            return Err(Error::InvalidConfig(format!(
                "resource '{raw}' names a service directly; selector must be empty"
            )));
        }
        return Ok(ResourceRef::Service { name: name.to_string() });
    }
    if raw == "pod" {
        let selector = selector.unwrap_or_default();
        return Ok(ResourceRef::PodSelector {
            selector: selector.to_string(),
        });
    }
    Err(Error::InvalidConfig(format!(
        "resource '{raw}' must be 'pod/<name>', 'service/<name>', or 'pod' with a selector"
    )))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    pub name: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

/// The strict YAML configuration shape: unknown keys are rejected so a typo in the user's
/// config surfaces immediately instead of being silently ignored.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub contexts: Vec<ContextConfig>,
    pub health_check: HealthCheckConfig,
    pub reliability: ReliabilityConfig,
    pub mdns: MdnsConfig,
}

impl Config {
    /// Flattens the nested context/namespace/forward tree into the Forward set the Manager
    /// admits, validating local-port uniqueness across the whole set along the way.
    pub fn forwards(&self) -> Result<Vec<Forward>, Error> {
        let mut out = Vec::new();
        let mut seen_ports = std::collections::HashSet::new();
        for ctx in &self.contexts {
            for ns in &ctx.namespaces {
                for spec in ns.forwards.clone() {
                    let forward = spec.into_forward(&ctx.name, &ns.name)?;
                    if !seen_ports.insert(forward.local_port) {
                        return Err(Error::InvalidConfig(format!(
                            "local_port {} is used by more than one forward",
                            forward.local_port
                        )));
                    }
                    out.push(forward);
                }
            }
        }
        Ok(out)
    }
}
