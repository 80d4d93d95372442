//! Configuration resolution for the SSH relay.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_PORT` / `PORT` | 8080 | HTTP and WebSocket listen port |
//! | `RELAY_MAX_CLIENTS` | 100 | Maximum concurrently admitted sessions |
//! | `SSH_CONNECT_TIMEOUT` | 30s | SSH handshake timeout in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 300s | Command wall-clock limit in seconds |
//! | `RELAY_MAX_OUTPUT_BYTES` | 10 MiB | Output ceiling for a single run |
//! | `RELAY_IDLE_TIMEOUT` | 1800s | Inactivity before a session is evicted |
//! | `RELAY_SWEEP_INTERVAL` | 60s | Period of the idle sweep |
//! | `RELAY_SHUTDOWN_GRACE` | 5s | Time allowed for connections to drain on shutdown |

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default admission ceiling
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Default SSH handshake timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds (5 minutes)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Default output ceiling for one command (10 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Default idle eviction threshold in seconds (30 minutes)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Default sweep interval in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default graceful shutdown window in seconds
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

pub(crate) const PORT_ENV_VAR: &str = "RELAY_PORT";
pub(crate) const LEGACY_PORT_ENV_VAR: &str = "PORT";
pub(crate) const MAX_CLIENTS_ENV_VAR: &str = "RELAY_MAX_CLIENTS";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";
pub(crate) const MAX_OUTPUT_ENV_VAR: &str = "RELAY_MAX_OUTPUT_BYTES";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "RELAY_IDLE_TIMEOUT";
pub(crate) const SWEEP_INTERVAL_ENV_VAR: &str = "RELAY_SWEEP_INTERVAL";
pub(crate) const SHUTDOWN_GRACE_ENV_VAR: &str = "RELAY_SHUTDOWN_GRACE";

/// Read and parse an environment variable, ignoring unset or unparsable values.
fn env_value<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Resolve a value with priority: parameter -> env var -> default
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Some(value) = env_value(env_var) {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve the listen port. `RELAY_PORT` wins over the conventional `PORT`.
pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    if let Some(port) = port_param {
        return port;
    }
    env_value(PORT_ENV_VAR)
        .or_else(|| env_value(LEGACY_PORT_ENV_VAR))
        .unwrap_or(DEFAULT_PORT)
}

pub(crate) fn resolve_max_clients(param: Option<usize>) -> usize {
    resolve(param, MAX_CLIENTS_ENV_VAR, DEFAULT_MAX_CLIENTS)
}

// Zero would expire every handshake and run before it starts.
pub(crate) fn resolve_connect_timeout(param: Option<u64>) -> Duration {
    let secs = resolve(param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1))
}

pub(crate) fn resolve_command_timeout(param: Option<u64>) -> Duration {
    let secs = resolve(param, COMMAND_TIMEOUT_ENV_VAR, DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1))
}

pub(crate) fn resolve_max_output_bytes(param: Option<usize>) -> usize {
    resolve(param, MAX_OUTPUT_ENV_VAR, DEFAULT_MAX_OUTPUT_BYTES)
}

pub(crate) fn resolve_idle_timeout(param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(param, IDLE_TIMEOUT_ENV_VAR, DEFAULT_IDLE_TIMEOUT_SECS))
}

pub(crate) fn resolve_sweep_interval(param: Option<u64>) -> Duration {
    // A zero period would make tokio's interval panic.
    let secs = resolve(param, SWEEP_INTERVAL_ENV_VAR, DEFAULT_SWEEP_INTERVAL_SECS);
    Duration::from_secs(secs.max(1))
}

pub(crate) fn resolve_shutdown_grace(param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        param,
        SHUTDOWN_GRACE_ENV_VAR,
        DEFAULT_SHUTDOWN_GRACE_SECS,
    ))
}

/// Limits applied to a single remote command or file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    /// Wall-clock limit for a whole run
    pub timeout: Duration,
    /// Combined stdout and stderr byte ceiling
    pub max_output_bytes: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Fully resolved process settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub port: u16,
    pub max_clients: usize,
    pub connect_timeout: Duration,
    pub exec: ExecLimits,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl RelaySettings {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: resolve_port(None),
            max_clients: resolve_max_clients(None),
            connect_timeout: resolve_connect_timeout(None),
            exec: ExecLimits {
                timeout: resolve_command_timeout(None),
                max_output_bytes: resolve_max_output_bytes(None),
            },
            idle_timeout: resolve_idle_timeout(None),
            sweep_interval: resolve_sweep_interval(None),
            shutdown_grace: resolve_shutdown_grace(None),
        }
    }

    /// Address the HTTP listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            exec: ExecLimits::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod port {
        use super::*;

        #[test]
        fn test_param_wins() {
            assert_eq!(resolve_port(Some(9000)), 9000);
        }

        #[test]
        fn test_relay_port_preferred_over_port() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PORT_ENV_VAR, "9100");
                set_env(LEGACY_PORT_ENV_VAR, "9200");
            }
            let result = resolve_port(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PORT_ENV_VAR);
                remove_env(LEGACY_PORT_ENV_VAR);
            }
            assert_eq!(result, 9100);
        }

        #[test]
        fn test_legacy_port_used_as_fallback() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PORT_ENV_VAR);
                set_env(LEGACY_PORT_ENV_VAR, "9300");
            }
            let result = resolve_port(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(LEGACY_PORT_ENV_VAR);
            }
            assert_eq!(result, 9300);
        }

        #[test]
        fn test_default_port() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PORT_ENV_VAR);
                remove_env(LEGACY_PORT_ENV_VAR);
            }
            assert_eq!(resolve_port(None), DEFAULT_PORT);
        }
    }

    mod timeouts {
        use super::*;

        #[test]
        fn test_connect_timeout_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CONNECT_TIMEOUT_ENV_VAR, "12");
            }
            let result = resolve_connect_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CONNECT_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(12));
        }

        #[test]
        fn test_command_timeout_ignores_invalid_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(COMMAND_TIMEOUT_ENV_VAR, "five minutes");
            }
            let result = resolve_command_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(COMMAND_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));
        }

        #[test]
        fn test_idle_timeout_param() {
            assert_eq!(resolve_idle_timeout(Some(90)), Duration::from_secs(90));
        }

        #[test]
        fn test_sweep_interval_never_zero() {
            assert_eq!(resolve_sweep_interval(Some(0)), Duration::from_secs(1));
        }

        #[test]
        fn test_zero_timeouts_clamped() {
            assert_eq!(resolve_connect_timeout(Some(0)), Duration::from_secs(1));
            assert_eq!(resolve_command_timeout(Some(0)), Duration::from_secs(1));

            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CONNECT_TIMEOUT_ENV_VAR, "0");
                set_env(COMMAND_TIMEOUT_ENV_VAR, "0");
            }
            let connect = resolve_connect_timeout(None);
            let command = resolve_command_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CONNECT_TIMEOUT_ENV_VAR);
                remove_env(COMMAND_TIMEOUT_ENV_VAR);
            }
            assert_eq!(connect, Duration::from_secs(1));
            assert_eq!(command, Duration::from_secs(1));
        }

        #[test]
        fn test_ignores_negative_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(IDLE_TIMEOUT_ENV_VAR, "-10");
            }
            let result = resolve_idle_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(IDLE_TIMEOUT_ENV_VAR);
            }
            // Parsing fails for negative u64, so default is used
            assert_eq!(result, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        }
    }

    mod limits {
        use super::*;

        #[test]
        fn test_max_clients_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(MAX_CLIENTS_ENV_VAR, "7");
            }
            let result = resolve_max_clients(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(MAX_CLIENTS_ENV_VAR);
            }
            assert_eq!(result, 7);
        }

        #[test]
        fn test_zero_max_clients_is_valid() {
            assert_eq!(resolve_max_clients(Some(0)), 0);
        }

        #[test]
        fn test_max_output_default_is_ten_mib() {
            assert_eq!(DEFAULT_MAX_OUTPUT_BYTES, 10_485_760);
            assert_eq!(resolve_max_output_bytes(Some(1024)), 1024);
        }
    }

    mod settings {
        use super::*;

        #[test]
        fn test_defaults_match_constants() {
            let settings = RelaySettings::default();
            assert_eq!(settings.max_clients, 100);
            assert_eq!(settings.connect_timeout, Duration::from_secs(30));
            assert_eq!(settings.exec.timeout, Duration::from_secs(300));
            assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
            assert_eq!(settings.sweep_interval, Duration::from_secs(60));
        }

        #[test]
        fn test_listen_addr() {
            let settings = RelaySettings {
                port: 9001,
                ..Default::default()
            };
            assert_eq!(settings.listen_addr(), "0.0.0.0:9001");
        }
    }
}
