// Storage and transport adapters
//
// PostgreSQL backs the event log and the read model; Redis carries pub/sub.
// The engine only sees these through the storyline-core traits.

pub mod postgres;
pub mod read_model;
pub mod redis;

pub use self::postgres::{Database, PostgresEventLog};
pub use self::read_model::PostgresReadModel;
pub use self::redis::RedisBroadcaster;
