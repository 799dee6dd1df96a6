//! Persistence layer
//!
//! SQLite-based storage for the durable record of each assistant turn.
//! The gateway writes through `TurnStore`; chat/session CRUD lives with
//! the external collaborator that owns those tables.

mod database;
mod turns;

pub use database::Database;
pub use turns::{PersistedTurn, TurnStatus, TurnStore};
