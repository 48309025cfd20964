//! Concrete implementations of the `domains` storage ports.
//!
//! `memory` is always available. The Postgres adapter is behind the
//! `db-postgres` feature.

pub mod memory;
#[cfg(feature = "db-postgres")]
pub mod postgres;

pub use memory::{MemoryStore, MemoryTransaction};
#[cfg(feature = "db-postgres")]
pub use postgres::{PgStore, PgVoteTransaction};
