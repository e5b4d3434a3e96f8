use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Matches the port browser clients fall back to when no server URL is configured
pub const DEFAULT_SIGNALING_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_IDENTIFY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_ROOM_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub listen_addr: SocketAddr,
    /// How long a fresh connection may stay unidentified
    pub identify_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_message_size: usize,
    pub max_room_id_len: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            identify_timeout: Duration::from_secs(DEFAULT_IDENTIFY_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_BYTES,
            max_room_id_len: DEFAULT_MAX_ROOM_ID_LEN,
        }
    }
}

impl SignalingConfig {
    /// Read `CASTLINK_*` variables, keeping defaults for unset ones
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let listen_addr = parse_var(&lookup, "CASTLINK_ADDR")?.unwrap_or(defaults.listen_addr);
        let identify_timeout = secs_var(&lookup, "CASTLINK_IDENTIFY_TIMEOUT_SECS")?
            .unwrap_or(defaults.identify_timeout);
        let ping_interval =
            secs_var(&lookup, "CASTLINK_PING_INTERVAL_SECS")?.unwrap_or(defaults.ping_interval);
        let pong_timeout =
            secs_var(&lookup, "CASTLINK_PONG_TIMEOUT_SECS")?.unwrap_or(defaults.pong_timeout);
        let max_message_size = nonzero_var(&lookup, "CASTLINK_MAX_MESSAGE_BYTES")?
            .unwrap_or(defaults.max_message_size);
        let max_room_id_len = nonzero_var(&lookup, "CASTLINK_MAX_ROOM_ID_LEN")?
            .unwrap_or(defaults.max_room_id_len);

        Ok(Self {
            listen_addr,
            identify_timeout,
            ping_interval,
            pong_timeout,
            max_message_size,
            max_room_id_len,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

// zero would make tokio intervals panic and every frame oversized
fn nonzero_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    match parse_var::<T>(lookup, key)? {
        Some(value) if value == T::default() => Err(ConfigError::Invalid {
            key,
            value: lookup(key).unwrap_or_default(),
        }),
        other => Ok(other),
    }
}

fn secs_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(nonzero_var::<u64>(lookup, key)?.map(Duration::from_secs))
}
