//! Durable-storage collaborator for the distribution pipeline: sensor and
//! gateway metadata lookup, telemetry history, and the fire-and-forget
//! writer that keeps persistence off the ingestion hot path.

mod database;
mod error;
mod metadata;
mod schema;
mod telemetry;
mod writer;

pub use database::Database;
pub use error::StoreError;
pub use metadata::{GatewayRow, MetadataRepo, SensorRow};
pub use telemetry::{TelemetryRepo, TelemetryRow};
pub use writer::{StorageWriter, StorageWriterHandle};
