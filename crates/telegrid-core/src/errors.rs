/// Typed error hierarchy for the distribution pipeline.
/// Every failure here is local to one message or one connection; none of
/// them may take down the registry or the ingestion path.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DistributionError {
    /// Undecodable topic or payload. Dropped and counted, never fatal.
    #[error("malformed message on {context}: {detail}")]
    MalformedMessage { context: String, detail: String },

    /// Lost the pub/sub or WebSocket link. Retryable with backoff.
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    /// A connection's bounded outbound queue overflowed.
    #[error("slow consumer: outbound queue full")]
    SlowConsumer,

    /// No inbound ping within the heartbeat deadline.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Subscribe request for an identity the metadata store cannot resolve.
    #[error("unknown stream key: {0}")]
    UnknownStreamKey(String),

    /// Send on a queue whose receiver is gone.
    #[error("queue closed")]
    QueueClosed,

    /// Durable-storage collaborator failure. Best-effort path only.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl DistributionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportDisconnected(_) | Self::StorageUnavailable(_)
        )
    }

    pub fn malformed(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedMessage {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage { .. } => "malformed_message",
            Self::TransportDisconnected(_) => "transport_disconnected",
            Self::SlowConsumer => "slow_consumer",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::UnknownStreamKey(_) => "unknown_stream_key",
            Self::QueueClosed => "queue_closed",
            Self::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

/// Why a connection session was torn down. Carried on the connection handle
/// so the teardown path can log one definitive reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    SlowConsumer,
    HeartbeatTimeout,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::SlowConsumer => "slow_consumer",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}
