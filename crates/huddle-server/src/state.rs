use crate::engine::loopback::WorkerSettings;
use crate::engine::{default_media_codecs, RoutingEngine, TransportConfig};
use crate::session::{SessionCoordinator, SessionSettings};
use crate::ws::connections::ConnectionManager;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub engine_timeout: Duration,
    pub engine_death_grace: Duration,
    /// `None` allows any origin
    pub cors_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("127.0.0.1".to_string()),
            rtc_min_port: 10000,
            rtc_max_port: 20000,
            engine_timeout: Duration::from_millis(5000),
            engine_death_grace: Duration::from_millis(2000),
            cors_origin: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_address =
            std::env::var("HUDDLE_BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let listen_ip = std::env::var("HUDDLE_LISTEN_IP").unwrap_or(defaults.listen_ip);

        // An empty value means "announce the listen address as is"
        let announced_ip = match std::env::var("HUDDLE_ANNOUNCED_IP") {
            Ok(ip) if ip.is_empty() => None,
            Ok(ip) => Some(ip),
            Err(_) => defaults.announced_ip,
        };

        let rtc_min_port = parse_var("HUDDLE_RTC_MIN_PORT", defaults.rtc_min_port)?;
        let rtc_max_port = parse_var("HUDDLE_RTC_MAX_PORT", defaults.rtc_max_port)?;
        if rtc_min_port > rtc_max_port {
            anyhow::bail!(
                "HUDDLE_RTC_MIN_PORT ({}) is above HUDDLE_RTC_MAX_PORT ({})",
                rtc_min_port,
                rtc_max_port
            );
        }

        let engine_timeout = Duration::from_millis(parse_var("HUDDLE_ENGINE_TIMEOUT_MS", 5000)?);
        let engine_death_grace =
            Duration::from_millis(parse_var("HUDDLE_ENGINE_DEATH_GRACE_MS", 2000)?);

        let cors_origin = std::env::var("HUDDLE_CORS_ORIGIN")
            .ok()
            .filter(|origin| !origin.is_empty() && origin != "*");

        if announced_ip.is_none() {
            tracing::warn!("HUDDLE_ANNOUNCED_IP is empty, clients will see the listen address");
        }

        Ok(Config {
            bind_address,
            listen_ip,
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            engine_timeout,
            engine_death_grace,
            cors_origin,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            media_codecs: default_media_codecs(),
            transport: TransportConfig {
                listen_ip: self.listen_ip.clone(),
                announced_ip: self.announced_ip.clone(),
                ..TransportConfig::default()
            },
            engine_timeout: self.engine_timeout,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, value, e)),
        Err(_) => Ok(default),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<SessionCoordinator>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn RoutingEngine>) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let coordinator =
            SessionCoordinator::start(engine, config.session_settings(), connections.clone());

        Self {
            config,
            connections,
            coordinator,
        }
    }
}
