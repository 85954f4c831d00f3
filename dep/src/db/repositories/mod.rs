//! Status store backends:
//! - `local`: in-memory store for tests and single-host runs
//! - `postgres`: PostgreSQL store with Diesel ORM
pub mod local;
#[cfg(feature = "postgres-repo")]
pub mod postgres;

pub use local::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use postgres::{PoolStats, PostgresConfig, PostgresRepository};
