//! Configuration module for the LipoDoc simulator.
//!
//! Settings come from environment variables with validated fallbacks, the
//! same way for the binary and for embedding applications.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::transport::{Endpoint, TransportConfig};

/// Default server address of the bench setup
const DEFAULT_SERVER_ADDRESS: &str = "192.168.1.124";

/// Default server port
const DEFAULT_SERVER_PORT: u64 = 5000;

/// Default TCP connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default acknowledgment timeout in seconds
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 5;

/// Serial numbers simulated when none are configured
const DEFAULT_DEVICES: &str = "LD0000001";

/// Upper bound for any timeout setting
const MAX_TIMEOUT_SECS: u64 = 120;

/// Upper bound for the automatic donation interval
const MAX_DONATION_INTERVAL_SECS: u64 = 3600;

pub const ENV_SERVER_ADDRESS: &str = "LIPODOC_SERVER_ADDRESS";
pub const ENV_SERVER_PORT: &str = "LIPODOC_SERVER_PORT";
pub const ENV_CONNECT_TIMEOUT: &str = "LIPODOC_CONNECT_TIMEOUT_SECS";
pub const ENV_ACK_TIMEOUT: &str = "LIPODOC_ACK_TIMEOUT_SECS";
pub const ENV_DEVICES: &str = "LIPODOC_DEVICES";
pub const ENV_AUTO_CONNECT: &str = "LIPODOC_AUTO_CONNECT";
pub const ENV_DONATION_INTERVAL: &str = "LIPODOC_DONATION_INTERVAL_SECS";
pub const ENV_SEED: &str = "LIPODOC_SEED";

/// Delays that drive a device's status loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTiming {
    /// Lower bound of the randomized pause between ticks
    pub tick_interval_min: Duration,

    /// Upper bound (exclusive) of the randomized pause between ticks
    pub tick_interval_max: Duration,

    /// Pause after delivering a stored record
    pub send_throttle: Duration,

    /// Pause after an iteration fails unexpectedly
    pub error_backoff: Duration,

    /// Pause between records of a donation batch
    pub batch_pause: Duration,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            tick_interval_min: Duration::from_millis(3000),
            tick_interval_max: Duration::from_millis(4000),
            send_throttle: Duration::from_millis(500),
            error_backoff: Duration::from_millis(5000),
            batch_pause: Duration::from_millis(200),
        }
    }
}

/// Configuration for the simulator.
///
/// All settings can be configured via environment variables:
/// - `LIPODOC_SERVER_ADDRESS`: server host or IP (default: 192.168.1.124)
/// - `LIPODOC_SERVER_PORT`: server port (default: 5000)
/// - `LIPODOC_CONNECT_TIMEOUT_SECS`: TCP connect timeout (default: 10)
/// - `LIPODOC_ACK_TIMEOUT_SECS`: donation acknowledgment timeout (default: 5)
/// - `LIPODOC_DEVICES`: comma-separated serial numbers (default: LD0000001)
/// - `LIPODOC_AUTO_CONNECT`: connect devices at startup (default: true)
/// - `LIPODOC_DONATION_INTERVAL_SECS`: create a donation every N seconds, 0 disables (default: 0)
/// - `LIPODOC_SEED`: seed for reproducible device data (default: unset)
#[derive(Debug, Clone)]
pub struct Config {
    /// Default endpoint for new devices
    pub server: Endpoint,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// How long to wait for a donation acknowledgment
    pub ack_timeout: Duration,

    /// Serial numbers of the devices to simulate
    pub serials: Vec<String>,

    /// Whether devices connect at startup
    pub auto_connect: bool,

    /// Interval of automatic donation creation, if enabled
    pub donation_interval: Option<Duration>,

    /// Base seed for per-device random sources
    pub seed: Option<u64>,

    /// Status loop delays
    pub timing: DeviceTiming,
}

/// Error type for configuration loading failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Configuration error for {var}: '{value}' is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Configuration error for {var}: {value} is outside the allowed range {min}..={max}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Configuration error for {var}: value cannot be empty")]
    Empty { var: &'static str },
}

impl ConfigError {
    /// Name of the offending environment variable.
    pub fn var(&self) -> &'static str {
        match self {
            ConfigError::Invalid { var, .. }
            | ConfigError::OutOfRange { var, .. }
            | ConfigError::Empty { var } => var,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an unparsable or
    /// out-of-range value, or if the device list is empty.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lipodoc_sim::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server: {}", config.server);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = match lookup(ENV_SERVER_ADDRESS) {
            Some(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(ConfigError::Empty {
                        var: ENV_SERVER_ADDRESS,
                    });
                }
                trimmed.to_string()
            }
            None => DEFAULT_SERVER_ADDRESS.to_string(),
        };

        let port = parse_bounded(
            &lookup,
            ENV_SERVER_PORT,
            DEFAULT_SERVER_PORT,
            1,
            u16::MAX as u64,
        )?;
        let connect_timeout = parse_bounded(
            &lookup,
            ENV_CONNECT_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT_SECS,
            1,
            MAX_TIMEOUT_SECS,
        )?;
        let ack_timeout = parse_bounded(
            &lookup,
            ENV_ACK_TIMEOUT,
            DEFAULT_ACK_TIMEOUT_SECS,
            1,
            MAX_TIMEOUT_SECS,
        )?;
        let donation_interval = parse_bounded(
            &lookup,
            ENV_DONATION_INTERVAL,
            0,
            0,
            MAX_DONATION_INTERVAL_SECS,
        )?;

        let serials = parse_serials(lookup(ENV_DEVICES).as_deref().unwrap_or(DEFAULT_DEVICES))?;

        let auto_connect = match lookup(ENV_AUTO_CONNECT) {
            Some(value) => parse_bool(ENV_AUTO_CONNECT, &value)?,
            None => true,
        };

        let seed = match lookup(ENV_SEED) {
            Some(value) => {
                let parsed = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid {
                        var: ENV_SEED,
                        value: value.clone(),
                        expected: "unsigned 64-bit integer",
                    })?;
                Some(parsed)
            }
            None => None,
        };

        Ok(Self {
            server: Endpoint::new(address, port as u16),
            connect_timeout: Duration::from_secs(connect_timeout),
            ack_timeout: Duration::from_secs(ack_timeout),
            serials,
            auto_connect,
            donation_interval: (donation_interval > 0)
                .then(|| Duration::from_secs(donation_interval)),
            seed,
            timing: DeviceTiming::default(),
        })
    }

    /// Transport settings derived from this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
            ..TransportConfig::default()
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            server: Endpoint::new(DEFAULT_SERVER_ADDRESS, DEFAULT_SERVER_PORT as u16),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            serials: vec![DEFAULT_DEVICES.to_string()],
            auto_connect: true,
            donation_interval: None,
            seed: None,
            timing: DeviceTiming::default(),
        }
    }
}

/// Parse an integer variable and check it against inclusive bounds.
fn parse_bounded<F>(
    lookup: &F,
    var: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(default);
    };

    let parsed: u64 = value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.clone(),
        expected: "number",
    })?;

    if parsed < min || parsed > max {
        return Err(ConfigError::OutOfRange {
            var,
            value: parsed,
            min,
            max,
        });
    }

    Ok(parsed)
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "boolean",
        }),
    }
}

fn parse_serials(value: &str) -> Result<Vec<String>, ConfigError> {
    let serials: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if serials.is_empty() {
        return Err(ConfigError::Empty { var: ENV_DEVICES });
    }

    Ok(serials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server, Endpoint::new("192.168.1.124", 5000));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.serials, vec!["LD0000001".to_string()]);
        assert!(config.auto_connect);
        assert!(config.donation_interval.is_none());
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_empty_lookup_matches_default() {
        let config = Config::from_lookup(|_| None).unwrap();
        let default = Config::default();
        assert_eq!(config.server, default.server);
        assert_eq!(config.connect_timeout, default.connect_timeout);
        assert_eq!(config.serials, default.serials);
        assert_eq!(config.timing, DeviceTiming::default());
    }

    #[test]
    fn test_custom_values() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_SERVER_ADDRESS, " lipodoc.local "),
            (ENV_SERVER_PORT, "6001"),
            (ENV_ACK_TIMEOUT, "2"),
            (ENV_DEVICES, "LD0000001, LD0000002,,LD0000003"),
            (ENV_AUTO_CONNECT, "no"),
            (ENV_DONATION_INTERVAL, "15"),
            (ENV_SEED, "1234"),
        ]))
        .unwrap();

        assert_eq!(config.server, Endpoint::new("lipodoc.local", 6001));
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.serials, vec!["LD0000001", "LD0000002", "LD0000003"]);
        assert!(!config.auto_connect);
        assert_eq!(config.donation_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.transport_config().ack_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_port() {
        let err =
            Config::from_lookup(lookup_from(&[(ENV_SERVER_PORT, "not_a_port")])).unwrap_err();
        assert_eq!(err.var(), ENV_SERVER_PORT);
        assert!(err.to_string().contains("not a valid number"));
    }

    #[test]
    fn test_port_out_of_range() {
        let err = Config::from_lookup(lookup_from(&[(ENV_SERVER_PORT, "70000")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 70000, .. }));

        let err = Config::from_lookup(lookup_from(&[(ENV_SERVER_PORT, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 0, .. }));
    }

    #[test]
    fn test_timeout_out_of_range() {
        let err = Config::from_lookup(lookup_from(&[(ENV_CONNECT_TIMEOUT, "0")])).unwrap_err();
        assert_eq!(err.var(), ENV_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_empty_device_list() {
        let err = Config::from_lookup(lookup_from(&[(ENV_DEVICES, " , ,")])).unwrap_err();
        assert_eq!(err, ConfigError::Empty { var: ENV_DEVICES });
    }

    #[test]
    fn test_empty_address() {
        let err = Config::from_lookup(lookup_from(&[(ENV_SERVER_ADDRESS, "   ")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Empty {
                var: ENV_SERVER_ADDRESS
            }
        );
    }

    #[test]
    fn test_invalid_bool_and_seed() {
        let err = Config::from_lookup(lookup_from(&[(ENV_AUTO_CONNECT, "maybe")])).unwrap_err();
        assert_eq!(err.var(), ENV_AUTO_CONNECT);

        let err = Config::from_lookup(lookup_from(&[(ENV_SEED, "-1")])).unwrap_err();
        assert_eq!(err.var(), ENV_SEED);
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        let _guard = EnvGuard::set(ENV_DONATION_INTERVAL, "30");

        let config = Config::from_env().expect("Should load from environment");
        assert_eq!(config.donation_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid {
            var: "TEST_VAR",
            value: "abc".to_string(),
            expected: "number",
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: 'abc' is not a valid number"
        );
    }
}
