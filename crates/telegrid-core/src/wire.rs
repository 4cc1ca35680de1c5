use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Quality, StatusUpdate, TelemetryEvent};
use crate::ids::{ConnectionId, StreamKey};

/// Control frames a viewer sends over the WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { stream_keys: Vec<StreamKey> },
    Unsubscribe { stream_keys: Vec<StreamKey> },
    Ping { timestamp: DateTime<Utc> },
    GetStats,
}

/// Frames the server pushes to a viewer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake acknowledgement; advertises the heartbeat interval the
    /// client is expected to ping at.
    ConnectionEstablished {
        connection_id: ConnectionId,
        heartbeat_interval_secs: u64,
    },

    Telemetry {
        stream_key: StreamKey,
        value: f64,
        timestamp: DateTime<Utc>,
        quality: Quality,
        sequence: u64,
    },

    /// Acknowledges a subscribe request. Keys the metadata store could not
    /// resolve land in `rejected`; the rest are active.
    SubscriptionAck {
        stream_keys: Vec<StreamKey>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        rejected: Vec<StreamKey>,
    },

    Pong {
        timestamp: DateTime<Utc>,
    },

    Status {
        stream_key: StreamKey,
        status: String,
    },

    Stats {
        connections: usize,
        streams: usize,
    },

    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn telemetry(event: &TelemetryEvent) -> Self {
        Self::Telemetry {
            stream_key: event.stream_key.clone(),
            value: event.value,
            timestamp: event.captured_at,
            quality: event.quality,
            sequence: event.sequence,
        }
    }

    pub fn status(update: &StatusUpdate) -> Self {
        Self::Status {
            stream_key: update.stream_key.clone(),
            status: update.status.clone(),
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::Telemetry { .. } => "telemetry",
            Self::SubscriptionAck { .. } => "subscription_ack",
            Self::Pong { .. } => "pong",
            Self::Status { .. } => "status",
            Self::Stats { .. } => "stats",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tagged_encoding() {
        let frame = ClientFrame::Subscribe {
            stream_keys: vec![StreamKey::from_parts("gw-01", "temp-07")],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        assert!(json.contains("gw-01/temp-07"));
    }

    #[test]
    fn client_frame_get_stats_is_bare() {
        let json = serde_json::to_string(&ClientFrame::GetStats).unwrap();
        assert_eq!(json, "{\"type\":\"get_stats\"}");
        let parsed: ClientFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientFrame::GetStats));
    }

    #[test]
    fn telemetry_frame_from_event() {
        let event = TelemetryEvent::new(
            StreamKey::from_parts("gw-01", "temp-07"),
            Utc::now(),
            18.25,
            Quality::Uncertain,
            3,
        );
        let frame = ServerFrame::telemetry(&event);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"telemetry\""));
        assert!(json.contains("\"sequence\":3"));
        assert!(json.contains("\"quality\":\"uncertain\""));
    }

    #[test]
    fn subscription_ack_omits_empty_rejected() {
        let frame = ServerFrame::SubscriptionAck {
            stream_keys: vec![StreamKey::from_raw("a")],
            rejected: vec![],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("rejected"));

        let frame = ServerFrame::SubscriptionAck {
            stream_keys: vec![],
            rejected: vec![StreamKey::from_raw("ghost")],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"rejected\":[\"ghost\"]"));
    }

    #[test]
    fn subscription_ack_deserializes_without_rejected() {
        let parsed: ServerFrame =
            serde_json::from_str("{\"type\":\"subscription_ack\",\"stream_keys\":[\"a\"]}").unwrap();
        match parsed {
            ServerFrame::SubscriptionAck { stream_keys, rejected } => {
                assert_eq!(stream_keys.len(), 1);
                assert!(rejected.is_empty());
            }
            other => panic!("expected subscription_ack, got {other:?}"),
        }
    }

    #[test]
    fn server_frame_type_strings() {
        let pong = ServerFrame::Pong { timestamp: Utc::now() };
        assert_eq!(pong.frame_type(), "pong");
        let err = ServerFrame::Error { message: "bad frame".into() };
        assert_eq!(err.frame_type(), "error");
    }

    #[test]
    fn server_frame_serde_roundtrip() {
        let frames = vec![
            ServerFrame::ConnectionEstablished {
                connection_id: ConnectionId::new(),
                heartbeat_interval_secs: 30,
            },
            ServerFrame::Status {
                stream_key: StreamKey::from_raw("gw-01/temp-07"),
                status: "online".into(),
            },
            ServerFrame::Stats { connections: 2, streams: 5 },
        ];
        for frame in &frames {
            let json = serde_json::to_string(frame).unwrap();
            let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }
}
