//! Status store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Pipeline / Dispatcher / ErrorDigest                    │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │  Arc<dyn StatusRepository>
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  StatusRepository trait (repository/status.rs)          │
//! └───────────────────┬─────────────────────────────────────┘
//!          ┌──────────┴───────────┐
//!   LocalRepository        PostgresRepository
//!   (in-memory)            (Diesel + r2d2, feature postgres-repo)
//! ```
//!
//! `checksum` holds the MD5 helpers used for archive products and for the
//! duplicate-submission check.

// Feature flag priority: postgres > local
#[cfg(not(any(feature = "postgres-repo", feature = "local-repo")))]
compile_error!("Enable at least one repository backend feature.");

pub mod checksum;
pub mod factory;
pub mod repo_config;
pub mod repositories;
pub mod repository;

#[cfg(feature = "postgres-repo")]
pub use repositories::postgres::{PoolStats, PostgresConfig};
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    _private: (),
}
#[cfg(not(feature = "postgres-repo"))]
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    _private: (),
}

pub use checksum::{calculate_checksum, file_md5, md5sum_line};
pub use factory::{RepositoryBuilder, RepositoryFactory, RepositoryType};
pub use repo_config::RepositoryConfig;
pub use repositories::LocalRepository;
#[cfg(feature = "postgres-repo")]
pub use repositories::PostgresRepository;
pub use repository::{ErrorContext, RepositoryError, RepositoryResult, StatusRepository};

use anyhow::{Context, Result};
use std::sync::{Arc, OnceLock};

/// Process-wide store for the runner binary.
static REPOSITORY: OnceLock<Arc<dyn StatusRepository>> = OnceLock::new();

/// Initialize the global store from a repository config (env overrides apply).
pub async fn init_repository(config: &RepositoryConfig) -> Result<&'static Arc<dyn StatusRepository>> {
    if let Some(repo) = REPOSITORY.get() {
        return Ok(repo);
    }

    let repo = RepositoryFactory::from_repository_config(config)
        .await
        .map_err(|e| anyhow::Error::msg(e.to_string()))
        .context("Failed to initialize status store")?;
    let _ = REPOSITORY.set(repo);
    get_repository()
}

pub fn get_repository() -> Result<&'static Arc<dyn StatusRepository>> {
    REPOSITORY
        .get()
        .context("Status store not initialized. Call init_repository() first.")
}
