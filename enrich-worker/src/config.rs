use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use enrich_common::retry::RetryPolicy;

use crate::error::ConfigError;
use crate::resolver::{OnFailPolicy, ResolverSettings};
use crate::stage::StageSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "ENRICH_SERVICE", default = "openalex")]
    pub service: ServiceName,

    #[envconfig(from = "ENRICH_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(default = "100")]
    pub packet_size: usize,

    #[envconfig(default = "1000")]
    pub buffer_size: usize,

    #[envconfig(nested = true)]
    pub cache: CacheConfig,

    #[envconfig(nested = true)]
    pub resolver: ResolverConfig,

    #[envconfig(nested = true)]
    pub openalex: OpenAlexConfig,

    #[envconfig(nested = true)]
    pub hal: HalConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stage_settings(&self) -> Result<StageSettings, ConfigError> {
        if self.packet_size == 0 {
            return Err(ConfigError::Zero("PACKET_SIZE"));
        }
        if self.resolver.max_attempts == 0 {
            return Err(ConfigError::Zero("MAX_ATTEMPTS"));
        }

        Ok(StageSettings {
            enabled: self.enabled,
            cache_ttl: time::Duration::from_secs(self.cache.cache_ttl),
            packet_size: self.packet_size,
            watermark: self.buffer_size,
            resolver: self.resolver.settings(),
        })
    }
}

#[derive(Envconfig, Clone)]
pub struct CacheConfig {
    #[envconfig(default = "true")]
    pub cache_enabled: bool,

    #[envconfig(default = "redis")]
    pub cache_backend: CacheBackend,

    /// Seconds.
    #[envconfig(default = "604800")]
    pub cache_ttl: u64,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "100000")]
    pub memory_cache_capacity: u64,
}

#[derive(Envconfig, Clone)]
pub struct ResolverConfig {
    #[envconfig(default = "200")]
    pub throttle: EnvMsDuration,

    #[envconfig(default = "5")]
    pub max_attempts: u32,

    #[envconfig(default = "1000")]
    pub base_wait_time: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub max_wait_time: EnvMsDuration,

    #[envconfig(default = "abort")]
    pub on_fail: OnFailPolicy,

    #[envconfig(default = "600000")]
    pub retry_ceiling: EnvMsDuration,

    #[envconfig(default = "250")]
    pub rate_limit_margin: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub request_timeout: EnvMsDuration,
}

impl ResolverConfig {
    pub fn settings(&self) -> ResolverSettings {
        ResolverSettings {
            throttle: self.throttle.0,
            max_attempts: self.max_attempts,
            retry_policy: RetryPolicy::new(2, self.base_wait_time.0, Some(self.max_wait_time.0)),
            on_fail: self.on_fail,
            retry_ceiling: self.retry_ceiling.0,
            rate_limit_margin: self.rate_limit_margin.0,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct OpenAlexConfig {
    #[envconfig(default = "https://api.openalex.org/")]
    pub openalex_url: String,

    /// Contact address sent to the polite pool. Empty disables it.
    #[envconfig(default = "ezteam@couperin.org")]
    pub openalex_mailto: String,

    pub openalex_api_key: Option<String>,
}

impl OpenAlexConfig {
    pub fn mailto(&self) -> Option<String> {
        let mailto = self.openalex_mailto.trim();
        (!mailto.is_empty()).then(|| mailto.to_owned())
    }
}

#[derive(Envconfig, Clone)]
pub struct HalConfig {
    #[envconfig(default = "https://api.archives-ouvertes.fr/")]
    pub hal_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceName {
    OpenAlex,
    Hal,
}

impl FromStr for ServiceName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "openalex" => Ok(ServiceName::OpenAlex),
            "hal" => Ok(ServiceName::Hal),
            invalid => Err(ConfigError::InvalidService(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "redis" => Ok(CacheBackend::Redis),
            "memory" => Ok(CacheBackend::Memory),
            invalid => Err(ConfigError::InvalidCacheBackend(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
