use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// ZeroMQ endpoint the SUB socket connects to, e.g. "tcp://127.0.0.1:5556".
    pub zmq_sub_endpoint: String,
    pub ha: HaConfig,
    pub mode: SinkMode,
}

#[derive(Debug, Clone)]
pub struct HaConfig {
    pub base_url: String,
    pub token: String,
}

/// Which sink the bridge feeds.
#[derive(Debug, Clone)]
pub enum SinkMode {
    /// Fire qmdevha_* events on the Home Assistant event bus.
    Events,
    /// Drive a switch and a climate entity through service calls.
    Remote {
        light_entity_id: String,
        climate_entity_id: String,
    },
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let mode = match env_or_default("BRIDGE_MODE", "events".to_string()).as_str() {
            "events" => SinkMode::Events,
            "remote" => SinkMode::Remote {
                light_entity_id: env_required("LIGHT_ENTITY_ID")?,
                climate_entity_id: env_required("CLIMATE_ENTITY_ID")?,
            },
            other => {
                return Err(format!(
                    "BRIDGE_MODE must be \"events\" or \"remote\", got \"{other}\""
                ))
            }
        };

        let config = Self {
            zmq_sub_endpoint: env_required("ZMQ_SUB_ENDPOINT")?,
            ha: HaConfig {
                base_url: env_required("HA_BASE_URL")?,
                token: env_required("HA_TOKEN")?,
            },
            mode,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            SinkMode::Events => "events",
            SinkMode::Remote { .. } => "remote",
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.zmq_sub_endpoint.is_empty() {
            return Err("ZMQ_SUB_ENDPOINT must not be empty".into());
        }
        if self.ha.base_url.is_empty() {
            return Err("HA_BASE_URL must not be empty".into());
        }
        if self.ha.token.is_empty() {
            return Err("HA_TOKEN must not be empty".into());
        }
        if let SinkMode::Remote {
            light_entity_id,
            climate_entity_id,
        } = &self.mode
        {
            if light_entity_id.is_empty() {
                return Err("LIGHT_ENTITY_ID must not be empty".into());
            }
            if climate_entity_id.is_empty() {
                return Err("CLIMATE_ENTITY_ID must not be empty".into());
            }
        }
        Ok(())
    }
}
