use serde::Serialize;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SignalError};
use crate::signaling::RoomPolicy;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct Config {
    pub server: ServerConfig,
    pub rooms: RoomConfig,
    pub ice: IceConfig,
    pub log_format: LogFormat,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub ttl: Duration,
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub grace_tick: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines, anything else the pretty formatter.
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        let policy = RoomPolicy::default();
        Self {
            ttl: policy.ttl,
            grace_period: policy.grace_period,
            sweep_interval: Duration::from_secs(5 * 60),
            grace_tick: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// `CORS_ORIGIN` must be `*` or an http(s) origin.
    pub fn validate(&self) -> Result<()> {
        let origin = self.cors_origin.as_str();
        if origin == "*" || origin.starts_with("http://") || origin.starts_with("https://") {
            Ok(())
        } else {
            Err(SignalError::InvalidConfiguration(format!(
                "CORS_ORIGIN must be '*' or an http(s) origin, got {:?}",
                origin
            )))
        }
    }
}

impl RoomConfig {
    pub fn policy(&self) -> RoomPolicy {
        RoomPolicy {
            ttl: self.ttl,
            grace_period: self.grace_period,
        }
    }

    /// Timer periods must be non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(SignalError::InvalidConfiguration(
                "ROOM_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.grace_tick.is_zero() {
            return Err(SignalError::InvalidConfiguration(
                "ROOM_GRACE_TICK_MS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl IceConfig {
    /// STUN from `STUN_SERVER_URL` (comma separated), TURN only when all three
    /// `TURN_*` variables are present.
    pub fn from_env() -> Self {
        let stun_servers = env::var("STUN_SERVER_URL")
            .unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let mut turn_servers = vec![];

        if let (Ok(turn_url), Ok(username), Ok(credential)) = (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![turn_url],
                username,
                credential,
            });
        }

        Self {
            stun_servers,
            turn_servers,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = match env::var("SERVER_PORT") {
            Ok(port) => parse_value("SERVER_PORT", &port)?,
            Err(_) => env_or("PORT", 3001u16)?,
        };

        let defaults = RoomConfig::default();

        let log_format = LogFormat::from_env();

        let rooms = RoomConfig {
            ttl: Duration::from_secs(env_or("ROOM_TTL_SECS", defaults.ttl.as_secs())?),
            grace_period: Duration::from_secs(env_or(
                "ROOM_GRACE_SECS",
                defaults.grace_period.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(env_or(
                "ROOM_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            grace_tick: Duration::from_millis(env_or(
                "ROOM_GRACE_TICK_MS",
                defaults.grace_tick.as_millis() as u64,
            )?),
        };
        rooms.validate()?;

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            cors_origin: env::var("CORS_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
        };
        server.validate()?;

        Ok(Self {
            server,
            rooms,
            ice: IceConfig::from_env(),
            log_format,
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        SignalError::ConfigurationParseFailed(format!("{} has invalid value {:?}", key, raw))
    })
}
