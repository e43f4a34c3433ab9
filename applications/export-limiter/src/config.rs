use crate::error::AppError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use std::{fs, path::Path};

/// Active export limit (W), read/write.
pub const REG_EXPORT_LIMIT: u16 = 0x08A2;
/// Default/grid maximum limit (W), only ever read.
pub const REG_GRID_MAX: u16 = 0x08A5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Random `export-limiter-<uuid>` when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Prefix for every state and command topic
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_base_topic() -> String {
    "export_limiter".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus slave/unit id, 85 (0x55) for Bytewatt inverters
    #[serde(default = "default_slave")]
    pub slave: u8,
    #[serde(default)]
    pub registers: RegisterConfig,
    pub price: PriceSourceConfig,
    /// Prices at or below this value (c/kWh) curtail export
    #[serde(default)]
    pub price_threshold: f64,
    /// Export limit (W) applied while curtailed
    #[serde(default)]
    pub curtailed_limit: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub io: IoConfig,
    /// Consecutive failed cycles before the device is reported unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial state of the automation switch
    #[serde(default)]
    pub automation_enabled: bool,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_slave() -> u8 {
    85
}
fn default_poll_interval() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.io.max_attempts,
            timeout: Duration::from_secs(self.io.timeout_secs),
            backoff: Duration::from_millis(self.io.backoff_ms),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: String| Err(AppError::Config(format!("device '{}': {}", self.name, msg)));

        if self.name.is_empty() || self.name.contains(['/', '+', '#']) {
            return fail("name must be non-empty and free of '/', '+', '#'".into());
        }
        if self.host.is_empty() {
            return fail("host cannot be empty".into());
        }
        if !(1..=247).contains(&self.slave) {
            return fail(format!("slave {} out of range 1..=247", self.slave));
        }
        if !(-100.0..=100.0).contains(&self.price_threshold) {
            return fail(format!(
                "price_threshold {} out of range -100..=100",
                self.price_threshold
            ));
        }
        if self.curtailed_limit > 50_000 {
            return fail(format!(
                "curtailed_limit {} out of range 0..=50000",
                self.curtailed_limit
            ));
        }
        if !(10..=300).contains(&self.poll_interval_secs) {
            return fail(format!(
                "poll_interval_secs {} out of range 10..=300",
                self.poll_interval_secs
            ));
        }
        if self.io.max_attempts == 0 || self.io.timeout_secs == 0 {
            return fail("io.max_attempts and io.timeout_secs must be at least 1".into());
        }
        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1".into());
        }
        if self.price.topic.is_empty() {
            return fail("price.topic cannot be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default = "default_export_limit_register")]
    pub export_limit: u16,
    #[serde(default = "default_grid_max_register")]
    pub grid_max: u16,
}

fn default_export_limit_register() -> u16 {
    REG_EXPORT_LIMIT
}
fn default_grid_max_register() -> u16 {
    REG_GRID_MAX
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            export_limit: REG_EXPORT_LIMIT,
            grid_max: REG_GRID_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSourceConfig {
    /// MQTT topic filter carrying price updates; wildcards allowed
    pub topic: String,
    /// JSONPath to the price; when absent the payload itself is the number
    pub value_path: Option<String>,
    #[serde(default)]
    pub timestamp: TimestampConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// JSONPath to the timestamp; if absent, now() is used.
    pub path: Option<String>,
    /// "rfc3339" | "unix_ms" | "unix_s" | "iso8601"
    #[serde(default = "default_ts_format")]
    pub format: String,
}
fn default_ts_format() -> String {
    "rfc3339".into()
}
impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: default_ts_format(),
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if MQTT_HOST env is set, override `mqtt.host`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        use anyhow::Context;

        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded).map_err(AppError::from)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.mqtt.host.is_empty() {
            return Err(AppError::Config("mqtt.host cannot be empty".into()));
        }
        if self.devices.is_empty() {
            return Err(AppError::Config(
                "config must include at least one device".into(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// Notes:
/// - "$.something" (JSONPath) is NOT matched; only "$(" and "${" are.
/// - "$$" becomes a literal "$" (escape).
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{}'", close))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, returning the collected string.
/// Consumes the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn device_yaml(extra: &str) -> String {
        format!(
            r#"
mqtt:
  host: "localhost"
devices:
  - name: "garage"
    host: "192.168.20.29"
    price:
      topic: "homeassistant/sensor/amber_price/state"
{extra}
"#
        )
    }

    fn parse(yaml: &str) -> Result<Config, AppError> {
        let cfg: Config = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = parse(&device_yaml("")).unwrap();
        let dev = &cfg.devices[0];

        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.base_topic, "export_limiter");
        assert_eq!(dev.port, 502);
        assert_eq!(dev.slave, 85);
        assert_eq!(dev.registers.export_limit, 0x08A2);
        assert_eq!(dev.registers.grid_max, 0x08A5);
        assert_eq!(dev.price_threshold, 0.0);
        assert_eq!(dev.curtailed_limit, 0);
        assert_eq!(dev.poll_interval(), Duration::from_secs(60));
        assert_eq!(dev.failure_threshold, 3);
        assert!(!dev.automation_enabled);

        let policy = dev.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.timeout, Duration::from_secs(10));
        assert_eq!(policy.backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_slave_out_of_range_rejected() {
        let err = parse(&device_yaml("    slave: 0")).unwrap_err();
        assert!(err.to_string().contains("device 'garage'"), "{err}");
        assert!(err.to_string().contains("slave"), "{err}");
    }

    #[test]
    fn test_poll_interval_out_of_range_rejected() {
        let err = parse(&device_yaml("    poll_interval_secs: 5")).unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"), "{err}");
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = parse(&device_yaml("    price_threshold: 150.0")).unwrap_err();
        assert!(err.to_string().contains("price_threshold"), "{err}");
    }

    #[test]
    fn test_duplicate_device_names_rejected() {
        let yaml = r#"
mqtt:
  host: "localhost"
devices:
  - name: "a"
    host: "10.0.0.1"
    price: { topic: "price" }
  - name: "a"
    host: "10.0.0.2"
    price: { topic: "price" }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate device name"), "{err}");
    }

    #[test]
    fn test_no_devices_rejected() {
        let yaml = "mqtt:\n  host: localhost\ndevices: []\n";
        assert!(parse(yaml).is_err());
    }

    #[test]
    #[serial]
    fn test_expand_env_placeholders() {
        std::env::set_var("EXPORT_LIMITER_TEST_HOST", "10.1.2.3");

        let out = expand_env_placeholders("a: $(EXPORT_LIMITER_TEST_HOST)\nb: ${EXPORT_LIMITER_TEST_HOST}\nc: $.price\nd: $$5").unwrap();
        assert_eq!(out, "a: 10.1.2.3\nb: 10.1.2.3\nc: $.price\nd: $5");

        std::env::remove_var("EXPORT_LIMITER_TEST_HOST");
    }

    #[test]
    #[serial]
    fn test_expand_missing_var_is_error() {
        std::env::remove_var("EXPORT_LIMITER_DEFINITELY_UNSET");
        let err = expand_env_placeholders("x: $(EXPORT_LIMITER_DEFINITELY_UNSET)").unwrap_err();
        assert!(err.to_string().contains("EXPORT_LIMITER_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_unterminated_placeholder_is_error() {
        assert!(expand_env_placeholders("x: ${OPEN").is_err());
    }
}
