//! Events and their wire envelopes
//!
//! ## Special event names
//!
//! A few names carry meaning across every backend:
//!
//! | Name | Emitted |
//! |------|---------|
//! | `Created` | first launch on this machine |
//! | `Upgrade` | version changed since the last launch (carries `OldVersion`) |
//! | `Launch` | every session start |
//! | `Exception` | [`report_exception`](crate::AnalyticsSession::report_exception), capped per run |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// String key/value pairs attached to an event, trait set, or context
pub type Properties = BTreeMap<String, String>;

pub const CREATED_EVENT: &str = "Created";
pub const UPGRADE_EVENT: &str = "Upgrade";
pub const LAUNCH_EVENT: &str = "Launch";
pub const EXCEPTION_EVENT: &str = "Exception";

/// A named occurrence submitted for remote recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub name: String,
    pub properties: Properties,
}

impl EventRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_properties(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    /// Overlay process-wide defaults; defaults win on key collision
    pub fn merge_defaults(mut self, defaults: &Properties) -> Self {
        for (key, value) in defaults {
            self.properties.insert(key.clone(), value.clone());
        }
        self
    }
}

/// What an envelope asks the remote service to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Track,
    Identify,
}

/// Wire representation of one track or identify call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,

    /// Anonymous id of this installation
    pub user_id: String,

    /// Event name (track only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Event properties (track only)
    #[serde(skip_serializing_if = "Properties::is_empty", default)]
    pub properties: Properties,

    /// User traits (identify only)
    #[serde(skip_serializing_if = "Properties::is_empty", default)]
    pub traits: Properties,

    #[serde(skip_serializing_if = "Properties::is_empty", default)]
    pub context: Properties,

    /// When the host submitted the call
    pub timestamp: DateTime<Utc>,

    /// Random id so the service can drop retried duplicates
    pub message_id: String,
}

impl Envelope {
    pub fn track(user_id: &str, event: EventRecord) -> Self {
        Self {
            kind: EnvelopeKind::Track,
            user_id: user_id.to_string(),
            event: Some(event.name),
            properties: event.properties,
            traits: Properties::new(),
            context: Properties::new(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn identify(user_id: &str, traits: &Properties, context: &Properties) -> Self {
        Self {
            kind: EnvelopeKind::Identify,
            user_id: user_id.to_string(),
            event: None,
            properties: Properties::new(),
            traits: traits.clone(),
            context: context.clone(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn is_track(&self) -> bool {
        self.kind == EnvelopeKind::Track
    }
}

/// Envelopes delivered in one transport call
#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
    pub envelopes: Vec<Envelope>,
}

impl Batch {
    pub fn single(envelope: Envelope) -> Self {
        Self {
            envelopes: vec![envelope],
        }
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Number of track envelopes (identify calls are not counted as events)
    pub fn track_count(&self) -> usize {
        self.envelopes.iter().filter(|e| e.is_track()).count()
    }
}
