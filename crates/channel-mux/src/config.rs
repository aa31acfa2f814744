//! Manager configuration and the on-disk settings format.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::HttpTokenProvider;
use crate::policy::{
    Backoff, DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY, ReconnectPolicy,
};
use crate::types::{Error, TokenProvider};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Configuration for [`ConnectionManager::new`](crate::ConnectionManager::new).
pub struct ManagerConfig {
    /// Hub endpoint (`ws://` or `wss://`).
    pub url: Url,
    /// Called once per connection attempt for the authentication credential.
    pub get_token: TokenProvider,
    /// Retry budget and delay between attempts.
    pub reconnect: ReconnectPolicy,
    /// Upper bound on transport open plus handshake.
    pub connect_timeout: Duration,
    /// Treat the connection as dead after this long without an inbound frame.
    pub idle_timeout: Option<Duration>,
    /// Frames queued by [`send`](crate::ConnectionManager::send) before it
    /// starts returning false.
    pub outbound_capacity: usize,
}

impl ManagerConfig {
    pub fn new(url: Url, get_token: TokenProvider) -> Self {
        Self {
            url,
            get_token,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Build a config from loaded settings, fetching credentials from the
    /// settings' token endpoint.
    pub fn from_settings(settings: &HubSettings) -> Result<Self, Error> {
        settings.validate()?;
        let url = Url::parse(&settings.url)?;
        let token_url = Url::parse(&settings.token_url)?;
        let provider = HttpTokenProvider::new(token_url)?.into_provider();
        let mut config = Self::new(url, provider);
        config.reconnect = settings.timing.reconnect_policy();
        config.connect_timeout = Duration::from_millis(settings.timing.connect_timeout_ms);
        config.idle_timeout = settings.timing.idle_timeout_ms.map(Duration::from_millis);
        Ok(config)
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("url", &self.url.as_str())
            .field("reconnect", &self.reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("outbound_capacity", &self.outbound_capacity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct HubSettings {
    pub url: String,
    pub token_url: String,
    #[serde(default)]
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: Option<u64>,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: None,
        }
    }
}

impl TimingSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed(initial),
            BackoffKind::Exponential => Backoff::Exponential {
                initial,
                max: Duration::from_millis(self.max_delay_ms),
                factor: DEFAULT_BACKOFF_FACTOR,
            },
        };
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            backoff,
        }
    }
}

impl HubSettings {
    fn validate(&self) -> Result<(), Error> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "hub url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        let token_url = Url::parse(&self.token_url)?;
        if !matches!(token_url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "token_url must use http:// or https://, got {}",
                token_url.scheme()
            )));
        }
        if self.timing.max_attempts == 0 {
            return Err(Error::Config("timing.max_attempts must be at least 1".into()));
        }
        if self.timing.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "timing.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.timing.initial_delay_ms > self.timing.max_delay_ms
            && self.timing.backoff == BackoffKind::Exponential
        {
            return Err(Error::Config(
                "timing.initial_delay_ms must not exceed timing.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate hub settings from a YAML file.
pub async fn load(path: &Path) -> Result<HubSettings, Error> {
    let content = tokio::fs::read_to_string(path).await?;
    let settings: HubSettings = serde_yaml_ng::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}
