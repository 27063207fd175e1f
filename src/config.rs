use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Root configuration document.
///
/// The file is JSON with an `Applications` array; unknown fields are
/// ignored so the same file can carry deployment-specific extras.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(rename = "Applications", default)]
    pub applications: Vec<ApplicationConfig>,
}

/// Forwarding protocol of an application listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if value.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(de::Error::custom(format!(
                "invalid protocol '{}': expected 'TCP' or 'UDP'",
                value
            )))
        }
    }
}

/// What to do with an idle container group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InactiveAction {
    /// Freeze the processes, keep memory resident.
    #[default]
    Pause,
    /// Stop the containers entirely.
    Stop,
}

impl fmt::Display for InactiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InactiveAction::Pause => write!(f, "pause"),
            InactiveAction::Stop => write!(f, "stop"),
        }
    }
}

impl<'de> Deserialize<'de> for InactiveAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value.eq_ignore_ascii_case("pause") {
            Ok(InactiveAction::Pause)
        } else if value.eq_ignore_ascii_case("stop") {
            Ok(InactiveAction::Stop)
        } else {
            Err(de::Error::custom(format!(
                "invalid inactive action '{}': expected 'Pause' or 'Stop'",
                value
            )))
        }
    }
}

/// Configuration for one proxied application, immutable after load.
#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationConfig {
    /// Container runtime socket, e.g. `unix:///var/run/docker.sock`
    /// or `tcp://10.0.0.5:2375`.
    #[serde(rename = "SocketUri", default = "default_socket_uri")]
    pub socket_uri: String,

    /// Name of the container this listener fronts.
    #[serde(rename = "DockerContainerName")]
    pub container_name: String,

    /// Also suspend/wake every container sharing the base container's
    /// docker-compose project label.
    #[serde(rename = "ApplyToComposeGroup", default = "default_true")]
    pub apply_to_compose_group: bool,

    /// "TCP" (default) or "UDP", case-insensitive.
    #[serde(rename = "Protocol", default)]
    pub protocol: Protocol,

    /// Local port the proxy listens on.
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,

    /// Address traffic is forwarded to (default: 127.0.0.1).
    #[serde(rename = "TargetAddress", default = "default_target_address")]
    pub target_address: String,

    /// Port traffic is forwarded to.
    #[serde(rename = "TargetPort")]
    pub target_port: u16,

    /// Idle threshold before the container group is suspended.
    /// Formatted as `HH:MM:SS` or a bare number of seconds.
    #[serde(
        rename = "InactiveAfter",
        default = "default_inactive_after",
        deserialize_with = "deserialize_duration"
    )]
    pub inactive_after: Duration,

    /// How often the inactivity timer fires.
    #[serde(
        rename = "CheckInterval",
        default = "default_check_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub check_interval: Duration,

    /// "Pause" (default) or "Stop", case-insensitive.
    #[serde(rename = "InactiveAction", default)]
    pub inactive_action: InactiveAction,

    /// Fixed grace period after waking the group before traffic flows.
    #[serde(
        rename = "StartupDelay",
        default = "default_startup_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub startup_delay: Duration,

    /// Gate wakes on the container's own healthcheck reporting healthy.
    #[serde(rename = "HealthcheckEnabled", default)]
    pub healthcheck_enabled: bool,

    /// Poll interval while waiting for the healthcheck to pass.
    #[serde(
        rename = "HealthcheckInterval",
        default = "default_healthcheck_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub healthcheck_interval: Duration,
}

fn default_socket_uri() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_true() -> bool {
    true
}

fn default_target_address() -> String {
    "127.0.0.1".to_string()
}

fn default_inactive_after() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_healthcheck_interval() -> Duration {
    Duration::from_secs(1)
}

impl ApplicationConfig {
    /// Target as a dialable `address:port` string.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_address, self.target_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.container_name.trim().is_empty() {
            anyhow::bail!("DockerContainerName must not be empty");
        }
        if self.listen_port == 0 {
            anyhow::bail!(
                "application '{}': ListenPort must be non-zero",
                self.container_name
            );
        }
        if self.target_port == 0 {
            anyhow::bail!(
                "application '{}': TargetPort must be non-zero",
                self.container_name
            );
        }
        if self.check_interval.is_zero() {
            anyhow::bail!(
                "application '{}': CheckInterval must be non-zero",
                self.container_name
            );
        }
        Ok(())
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for application in &self.applications {
            application.validate()?;
        }
        Ok(())
    }
}

/// Parse a duration given as `HH:MM:SS` (seconds may be fractional)
/// or as a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let parts: Vec<&str> = value.split(':').collect();
    match parts.len() {
        1 => {
            let secs: f64 = parts[0]
                .parse()
                .map_err(|_| format!("invalid duration '{}'", value))?;
            if secs < 0.0 {
                return Err(format!("negative duration '{}'", value));
            }
            Ok(Duration::from_secs_f64(secs))
        }
        3 => {
            let hours: u64 = parts[0]
                .parse()
                .map_err(|_| format!("invalid hours in '{}'", value))?;
            let minutes: u64 = parts[1]
                .parse()
                .map_err(|_| format!("invalid minutes in '{}'", value))?;
            let seconds: f64 = parts[2]
                .parse()
                .map_err(|_| format!("invalid seconds in '{}'", value))?;
            if minutes >= 60 || seconds >= 60.0 || seconds < 0.0 {
                return Err(format!("out-of-range duration '{}'", value));
            }
            Ok(Duration::from_secs(hours * 3600 + minutes * 60)
                + Duration::from_secs_f64(seconds))
        }
        _ => Err(format!(
            "invalid duration '{}': expected 'HH:MM:SS' or seconds",
            value
        )),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration as 'HH:MM:SS' or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse_duration(value).map_err(de::Error::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| de::Error::custom("negative duration"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Duration, E> {
            if value < 0.0 {
                return Err(de::Error::custom("negative duration"));
            }
            Ok(Duration::from_secs_f64(value))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
