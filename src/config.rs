use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::DEFAULT_CONTEXT;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Credentials {
    pub login: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
}

impl Credentials {
    pub fn new(login: &str, passcode: &str) -> Self {
        Credentials {
            login: login.to_string(),
            passcode: Some(BASE64.encode(passcode)),
        }
    }

    pub fn get_passcode(&self) -> Option<String> {
        self.passcode.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }
}

/// Exponential backoff used by the session after a failed handshake or a dropped link.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the session gives up and reports Disconnected.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_delay_ms
            .saturating_mul(2u64.pow(exp))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Base delay plus up to 20% random jitter, still capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let jitter = if base >= 5 {
            rand::thread_rng().gen_range(0..=base / 5)
        } else {
            0
        };
        Duration::from_millis((base + jitter).min(self.max_delay_ms.max(base)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub ws_url: String,
    pub api_url: String,
    pub default_context: String,
    /// Publish destination for the default context
    pub default_destination: String,
    /// Publish destination for every other context
    pub context_destination: String,
    /// Inbound topic, `{context}` and `{user}` are substituted
    pub inbound_topic: String,
    pub handshake_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".to_string(),
            api_url: "http://localhost:8080/api".to_string(),
            default_context: DEFAULT_CONTEXT.to_string(),
            default_destination: "/app/chat.send".to_string(),
            context_destination: "/app/chat.sendContext".to_string(),
            inbound_topic: "/topic/{context}/{user}".to_string(),
            handshake_timeout_secs: 10,
            reconnect: ReconnectPolicy::default(),
            credentials: None,
        }
    }
}

impl ChatConfig {
    pub fn destination_for(&self, context: &str) -> &str {
        if context == self.default_context {
            &self.default_destination
        } else {
            &self.context_destination
        }
    }

    pub fn topic_for(&self, context: &str, user_id: &str) -> String {
        self.inbound_topic
            .replace("{context}", context)
            .replace("{user}", user_id)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Host part of `ws_url`, used as the STOMP virtual host.
    pub fn host(&self) -> &str {
        let rest = self
            .ws_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.ws_url);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority.split(':').next().unwrap_or(authority)
    }

    /// Apply `CONFAB_WS_URL`, `CONFAB_API_URL` and `CONFAB_CONTEXT` when set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CONFAB_WS_URL") {
            debug!("ws_url overridden from environment");
            self.ws_url = url;
        }
        if let Ok(url) = std::env::var("CONFAB_API_URL") {
            debug!("api_url overridden from environment");
            self.api_url = url;
        }
        if let Ok(context) = std::env::var("CONFAB_CONTEXT") {
            self.default_context = context;
        }
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the per-user config file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("confab");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn save_config(config: &ChatConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &ChatConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Configuration saved to {}", path.display());
    Ok(())
}

/// Load the config file (defaults when absent), then apply environment overrides.
pub fn load_config() -> Result<ChatConfig> {
    let mut config = load_config_from(&get_config_path()?)?;
    config.apply_env();
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<ChatConfig> {
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(ChatConfig::default());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: ChatConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
