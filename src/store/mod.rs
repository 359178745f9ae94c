pub mod database;
pub mod kv;
pub mod position_store;
pub mod telemetry;

pub use database::Database;
pub use kv::KvStore;
pub use position_store::{
    ClosedTrade, PendingOrder, PendingStatus, Position, PositionStatus, PositionStore,
};
pub use telemetry::{EventType, LifecycleEvent, TelemetryLog};
