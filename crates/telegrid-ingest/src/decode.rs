use chrono::{DateTime, Utc};
use serde::Deserialize;

use telegrid_core::{DistributionError, Quality};

/// A decoded inbound message, not yet validated against metadata.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundKind {
    Telemetry {
        gateway_id: String,
        sensor_id: String,
        reading: RawReading,
    },
    GatewayStatus {
        gateway_id: String,
        status: String,
    },
}

/// Payload of one telemetry message after JSON decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct RawReading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

#[derive(Deserialize)]
struct TelemetryPayload {
    value: f64,
    timestamp: Option<DateTime<Utc>>,
    quality: Option<String>,
}

#[derive(Deserialize)]
struct StatusPayload {
    status: String,
}

/// Decode a raw transport message. Topic layout:
/// `{prefix}/{gateway_id}/{sensor_id}/data` for telemetry and
/// `gateways/{gateway_id}/status` for liveness. A missing timestamp defaults
/// to now; a missing or unknown quality defaults to `good`.
pub fn decode(
    topic: &str,
    payload: &[u8],
    telemetry_prefix: &str,
) -> Result<InboundKind, DistributionError> {
    let parts: Vec<&str> = topic.split('/').collect();

    match parts.as_slice() {
        [prefix, gateway_id, sensor_id, "data"] if *prefix == telemetry_prefix => {
            if gateway_id.is_empty() || sensor_id.is_empty() {
                return Err(DistributionError::malformed(topic, "empty topic segment"));
            }
            let decoded: TelemetryPayload = serde_json::from_slice(payload)
                .map_err(|e| DistributionError::malformed(topic, e.to_string()))?;
            if !decoded.value.is_finite() {
                return Err(DistributionError::malformed(topic, "non-finite value"));
            }
            Ok(InboundKind::Telemetry {
                gateway_id: (*gateway_id).to_string(),
                sensor_id: (*sensor_id).to_string(),
                reading: RawReading {
                    value: decoded.value,
                    timestamp: decoded.timestamp.unwrap_or_else(Utc::now),
                    quality: Quality::from_wire(decoded.quality.as_deref()),
                },
            })
        }
        ["gateways", gateway_id, "status"] => {
            if gateway_id.is_empty() {
                return Err(DistributionError::malformed(topic, "empty gateway id"));
            }
            let decoded: StatusPayload = serde_json::from_slice(payload)
                .map_err(|e| DistributionError::malformed(topic, e.to_string()))?;
            Ok(InboundKind::GatewayStatus {
                gateway_id: (*gateway_id).to_string(),
                status: decoded.status,
            })
        }
        _ => Err(DistributionError::malformed(topic, "unrecognized topic layout")),
    }
}
