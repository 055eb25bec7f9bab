//! Event sinks: what to do with a decoded event.
//!
//! Two interchangeable implementations sit behind [`EventSink`]: `BusSink`
//! forwards events verbatim to the Home Assistant event bus, while
//! `RemoteControlSink` maps them onto service calls driving a switch and a
//! climate entity.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::ha::{HaApi, HaError};
use crate::protocol::{Event, KeyEvent, PackEvent};

pub const KEY_EVENT_TYPE: &str = "qmdevha_key_event";
pub const PACK_EVENT_TYPE: &str = "qmdevha_pack_event";

/// The one key the remote-control mapping reacts to.
const LIGHT_SOURCE_ID: i32 = 9;
const LIGHT_KEY_CODE: i32 = 0x13;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Perform the sink's effect for one decoded event.
    ///
    /// `timestamp` is monotonic seconds supplied by the bridge loop.
    /// Heartbeats and unknown messages are no-ops for every sink.
    async fn handle(&self, event: &Event, timestamp: f64) -> Result<(), HaError>;
}

#[derive(Serialize)]
struct KeyEventPayload {
    source_id: i32,
    key_code: i32,
    is_release: bool,
    timestamp: f64,
}

#[derive(Serialize)]
struct PackEventPayload {
    power_on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    degree: Option<i32>,
    timestamp: f64,
}

/// Forwards decoded events to the Home Assistant event bus.
pub struct BusSink<A> {
    api: A,
}

impl<A: HaApi> BusSink<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<A: HaApi> EventSink for BusSink<A> {
    async fn handle(&self, event: &Event, timestamp: f64) -> Result<(), HaError> {
        match *event {
            Event::Key(KeyEvent {
                source_id,
                key_code,
                is_release,
            }) => {
                debug!(
                    "firing {}: source_id={}, key_code=0x{:x}, is_release={}",
                    KEY_EVENT_TYPE, source_id, key_code, is_release
                );
                let payload = serde_json::to_value(KeyEventPayload {
                    source_id,
                    key_code,
                    is_release,
                    timestamp,
                })?;
                self.api.fire_event(KEY_EVENT_TYPE, payload).await
            }
            Event::Pack(PackEvent { power_on, degree }) => {
                debug!("firing {}: power_on={}", PACK_EVENT_TYPE, power_on);
                let payload = serde_json::to_value(PackEventPayload {
                    power_on,
                    degree,
                    timestamp,
                })?;
                self.api.fire_event(PACK_EVENT_TYPE, payload).await
            }
            Event::Heartbeat | Event::Unknown { .. } => Ok(()),
        }
    }
}

/// Maps decoded events onto Home Assistant service calls.
pub struct RemoteControlSink<A> {
    api: A,
    light_entity_id: String,
    climate_entity_id: String,
}

impl<A: HaApi> RemoteControlSink<A> {
    pub fn new(api: A, light_entity_id: String, climate_entity_id: String) -> Self {
        Self {
            api,
            light_entity_id,
            climate_entity_id,
        }
    }

    async fn set_light(&self, on: bool) -> Result<(), HaError> {
        let service = if on { "turn_on" } else { "turn_off" };
        self.api
            .call_service(
                "switch",
                service,
                serde_json::json!({ "entity_id": self.light_entity_id }),
            )
            .await
    }

    async fn set_climate(&self, on: bool) -> Result<(), HaError> {
        let hvac_mode = if on { "cool" } else { "off" };
        self.api
            .call_service(
                "climate",
                "set_hvac_mode",
                serde_json::json!({
                    "entity_id": self.climate_entity_id,
                    "hvac_mode": hvac_mode,
                }),
            )
            .await
    }
}

#[async_trait]
impl<A: HaApi> EventSink for RemoteControlSink<A> {
    async fn handle(&self, event: &Event, _timestamp: f64) -> Result<(), HaError> {
        match *event {
            Event::Key(KeyEvent {
                source_id,
                key_code,
                is_release,
            }) => {
                if source_id != LIGHT_SOURCE_ID || key_code != LIGHT_KEY_CODE {
                    debug!(
                        "ignoring key source_id={}, key_code=0x{:x}",
                        source_id, key_code
                    );
                    return Ok(());
                }
                // The key reports release after a full press, so release
                // toggles the light on and the press itself toggles it off.
                self.set_light(is_release).await
            }
            Event::Pack(PackEvent { power_on, .. }) => self.set_climate(power_on).await,
            Event::Heartbeat | Event::Unknown { .. } => Ok(()),
        }
    }
}
