use std::env;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveTime;
use url::Url;

use crate::error::{Result, RotaError};
use crate::proxy::client_hello::TlsFingerprint;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Control-plane HTTP server
    pub control: ControlConfig,
    /// Client-facing proxy listeners and relay
    pub proxy: ProxyConfig,
    /// IP rotation state machine timings
    pub rotation: RotationConfig,
    /// Health-check loop
    pub health: HealthConfig,
    /// Pool bookkeeping intervals
    pub pool: PoolConfig,
    /// Modem backend selection
    pub modem: ModemConfig,
    /// Screen flag and night-transfer window
    pub extras: ExtrasConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Control port (default: 1000); proxy IDs start right after it
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the per-instance listeners bind to (default: 0.0.0.0)
    pub host: String,
    /// Upstream connect timeout
    pub connect_timeout: Duration,
    /// Maximum size of a client's initial request head
    pub request_head_limit: usize,
    /// Reserved hostname for the in-band change-IP command
    pub control_hostname: String,
    /// Reserved path for the in-band change-IP command
    pub control_path: String,
    /// Rewrite the first outbound ClientHello to the canonical fingerprint
    pub tls_rewrite: bool,
    /// Canonical ClientHello sections
    pub fingerprint: TlsFingerprint,
}

impl ProxyConfig {
    /// The marker that identifies an in-band control request target
    pub fn control_marker(&self) -> String {
        format!("{}{}", self.control_hostname, self.control_path)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_head_limit: 16 * 1024,
            control_hostname: "control.internal".to_string(),
            control_path: "/changeip".to_string(),
            tls_rewrite: true,
            fingerprint: TlsFingerprint::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Minimum spacing between accepted non-forced rotation requests
    pub debounce: Duration,
    /// Wait after requesting a hardware disconnect
    pub disconnect_settle: Duration,
    /// Wait after requesting a hardware connect
    pub connect_settle: Duration,
    /// Address polls after reconnecting
    pub address_poll_attempts: u32,
    /// Pause between address polls
    pub address_poll_interval: Duration,
    /// Address polls when a client connects to an instance without a cached address
    pub accept_address_attempts: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(30),
            disconnect_settle: Duration::from_secs(10),
            connect_settle: Duration::from_secs(5),
            address_poll_attempts: 10,
            address_poll_interval: Duration::from_millis(500),
            accept_address_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// URL returning the caller's public address
    pub probe_url: Url,
    /// Per-probe timeout
    pub probe_timeout: Duration,
    /// Attempt budget of a probe cycle after a success
    pub initial_budget: u32,
    /// Budget increase per failed attempt
    pub budget_step: u32,
    /// Pause between failed attempts
    pub attempt_pause: Duration,
    /// Number of distinct recent addresses treated as duplicates
    pub history_size: usize,
    /// Append-only audit log of probe results
    pub ip_log_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_url: Url::parse("http://checkip.dyndns.org").expect("static URL is valid"),
            probe_timeout: Duration::from_secs(8),
            initial_budget: 20,
            budget_step: 3,
            attempt_pause: Duration::from_secs(1),
            history_size: 5,
            ip_log_path: "IP_Log.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Interface enumeration period
    pub refresh_interval: Duration,
    /// Rotation queue drain period
    pub queue_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            queue_poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModemBackend {
    #[default]
    Nmcli,
    Static,
}

impl ModemBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nmcli" | "networkmanager" => Some(ModemBackend::Nmcli),
            "static" => Some(ModemBackend::Static),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModemBackend::Nmcli => "nmcli",
            ModemBackend::Static => "static",
        }
    }
}

/// One entry of `MODEM_STATIC_INTERFACES`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticInterfaceSpec {
    pub name: String,
    pub address: Option<Ipv4Addr>,
    pub number: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModemConfig {
    pub backend: ModemBackend,
    pub static_interfaces: Vec<StaticInterfaceSpec>,
}

#[derive(Debug, Clone)]
pub struct ExtrasConfig {
    /// File whose presence means the screen is switched off
    pub screen_flag_path: String,
    /// Night transfer window start (local time)
    pub night_transfer_start: Option<NaiveTime>,
    /// Night transfer window end (local time, exclusive)
    pub night_transfer_end: Option<NaiveTime>,
}

impl Default for ExtrasConfig {
    fn default() -> Self {
        Self {
            screen_flag_path: "screen_off".to_string(),
            night_transfer_start: None,
            night_transfer_end: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let control_port: u16 = get_env_or("CONTROL_PORT", "1000").parse().map_err(|_| {
            RotaError::InvalidConfig("CONTROL_PORT must be a valid port number".into())
        })?;
        if control_port == u16::MAX {
            return Err(RotaError::InvalidConfig(
                "CONTROL_PORT leaves no room for proxy ports".into(),
            ));
        }

        let probe_url = get_env_or("HEALTH_PROBE_URL", "http://checkip.dyndns.org");
        let probe_url = Url::parse(&probe_url).map_err(|e| {
            RotaError::InvalidConfig(format!("HEALTH_PROBE_URL must be a valid URL: {}", e))
        })?;
        if probe_url.scheme() != "http" {
            return Err(RotaError::InvalidConfig(
                "HEALTH_PROBE_URL must use plain http".into(),
            ));
        }

        let backend_raw = get_env_or("MODEM_BACKEND", "nmcli");
        let backend = ModemBackend::from_str(&backend_raw).ok_or_else(|| {
            RotaError::InvalidConfig(format!("MODEM_BACKEND has unsupported value: {}", backend_raw))
        })?;

        Ok(Config {
            control: ControlConfig {
                host: get_env_or("CONTROL_HOST", "0.0.0.0"),
                port: control_port,
            },
            proxy: ProxyConfig {
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                connect_timeout: Duration::from_secs(parse_env("PROXY_CONNECT_TIMEOUT", 10)?),
                request_head_limit: parse_env("PROXY_REQUEST_HEAD_LIMIT", 16 * 1024)?,
                control_hostname: get_env_or("PROXY_CONTROL_HOSTNAME", "control.internal"),
                control_path: get_env_or("PROXY_CONTROL_PATH", "/changeip"),
                tls_rewrite: parse_env("TLS_REWRITE_ENABLED", true)?,
                fingerprint: parse_fingerprint()?,
            },
            rotation: RotationConfig {
                debounce: Duration::from_secs(parse_env("ROTATION_DEBOUNCE_SECS", 30)?),
                disconnect_settle: Duration::from_secs(parse_env(
                    "ROTATION_DISCONNECT_SETTLE_SECS",
                    10,
                )?),
                connect_settle: Duration::from_secs(parse_env(
                    "ROTATION_CONNECT_SETTLE_SECS",
                    5,
                )?),
                address_poll_attempts: parse_env("ROTATION_ADDRESS_POLL_ATTEMPTS", 10)?,
                address_poll_interval: Duration::from_millis(parse_env(
                    "ROTATION_ADDRESS_POLL_INTERVAL_MS",
                    500,
                )?),
                accept_address_attempts: parse_env("ACCEPT_ADDRESS_ATTEMPTS", 5)?,
            },
            health: HealthConfig {
                probe_url,
                probe_timeout: Duration::from_secs(parse_env("HEALTH_PROBE_TIMEOUT_SECS", 8)?),
                initial_budget: parse_env("HEALTH_INITIAL_BUDGET", 20)?,
                budget_step: parse_env("HEALTH_BUDGET_STEP", 3)?,
                attempt_pause: Duration::from_millis(parse_env("HEALTH_ATTEMPT_PAUSE_MS", 1000)?),
                history_size: parse_env::<usize>("IP_HISTORY_SIZE", 5)?.max(1),
                ip_log_path: get_env_or("IP_LOG_PATH", "IP_Log.txt"),
            },
            pool: PoolConfig {
                refresh_interval: Duration::from_secs(parse_env::<u64>("POOL_REFRESH_SECS", 5)?.max(1)),
                queue_poll_interval: Duration::from_millis(
                    parse_env::<u64>("POOL_QUEUE_POLL_MS", 50)?.max(1),
                ),
            },
            modem: ModemConfig {
                backend,
                static_interfaces: parse_static_interfaces(&get_env_or(
                    "MODEM_STATIC_INTERFACES",
                    "",
                ))?,
            },
            extras: ExtrasConfig {
                screen_flag_path: get_env_or("SCREEN_FLAG_PATH", "screen_off"),
                night_transfer_start: parse_time_env("NIGHT_TRANSFER_START")?,
                night_transfer_end: parse_time_env("NIGHT_TRANSFER_END")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the control server address
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.control.host, self.control.port)
    }

    /// ID assigned to the first proxy instance (also its port)
    pub fn first_instance_id(&self) -> u32 {
        self.control.port as u32 + 1
    }
}

/// Parse `name=ipv4[:number],...`
pub fn parse_static_interfaces(raw: &str) -> Result<Vec<StaticInterfaceSpec>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, rest) = entry.split_once('=').unwrap_or((entry, ""));
            let name = name.trim();
            if name.is_empty() {
                return Err(RotaError::InvalidConfig(format!(
                    "MODEM_STATIC_INTERFACES entry '{}' has no interface name",
                    entry
                )));
            }

            let (address, number) = match rest.split_once(':') {
                Some((addr, number)) => (addr.trim(), Some(number.trim().to_string())),
                None => (rest.trim(), None),
            };

            let address = if address.is_empty() {
                None
            } else {
                Some(address.parse::<Ipv4Addr>().map_err(|_| {
                    RotaError::InvalidConfig(format!(
                        "MODEM_STATIC_INTERFACES entry '{}' has an invalid IPv4 address",
                        entry
                    ))
                })?)
            };

            Ok(StaticInterfaceSpec {
                name: name.to_string(),
                address,
                number: number.filter(|n| !n.is_empty()),
            })
        })
        .collect()
}

fn parse_fingerprint() -> Result<TlsFingerprint> {
    let defaults = TlsFingerprint::default();
    Ok(TlsFingerprint {
        cipher_suites: parse_base64_env("TLS_CIPHER_SUITES")?.unwrap_or(defaults.cipher_suites),
        compression_methods: parse_base64_env("TLS_COMPRESSION_METHODS")?
            .unwrap_or(defaults.compression_methods),
        extensions: parse_base64_env("TLS_EXTENSIONS")?.unwrap_or(defaults.extensions),
    })
}

fn parse_base64_env(key: &str) -> Result<Option<Vec<u8>>> {
    let raw = env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    BASE64
        .decode(raw)
        .map(Some)
        .map_err(|e| RotaError::InvalidConfig(format!("{} must be valid base64: {}", key, e)))
}

fn parse_time_env(key: &str) -> Result<Option<NaiveTime>> {
    let raw = env::var(key).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    NaiveTime::parse_from_str(raw, "%H:%M")
        .map(Some)
        .map_err(|_| RotaError::InvalidConfig(format!("{} must be formatted as HH:MM", key)))
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| RotaError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
