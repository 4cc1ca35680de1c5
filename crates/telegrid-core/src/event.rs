use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::StreamKey;

/// Reading quality as reported by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    /// Parse the optional wire spelling. Absent or unrecognized input maps
    /// to `Good`, matching the gateway fleet's default.
    pub fn from_wire(s: Option<&str>) -> Self {
        match s {
            Some("uncertain") => Self::Uncertain,
            Some("bad") => Self::Bad,
            _ => Self::Good,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Uncertain => "uncertain",
            Self::Bad => "bad",
        }
    }
}

/// One normalized sensor reading. Produced exactly once by the ingestion
/// bridge, immutable afterwards; every subscriber queue gets its own copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub stream_key: StreamKey,
    pub captured_at: DateTime<Utc>,
    pub value: f64,
    pub quality: Quality,
    /// Monotonically increasing per stream key, assigned by the bridge.
    pub sequence: u64,
}

impl TelemetryEvent {
    pub fn new(
        stream_key: StreamKey,
        captured_at: DateTime<Utc>,
        value: f64,
        quality: Quality,
        sequence: u64,
    ) -> Self {
        Self {
            stream_key,
            captured_at,
            value,
            quality,
            sequence,
        }
    }
}

/// Gateway liveness change, fanned out to subscribers of every stream the
/// gateway owns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub stream_key: StreamKey,
    pub status: String,
    pub observed_at: DateTime<Utc>,
}
