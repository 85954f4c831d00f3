//! Status store trait definitions.
//!
//! - [`error`]: Error types for store operations
//! - [`status`]: The [`StatusRepository`] trait every backend implements

pub mod error;
pub mod status;

pub use error::{ErrorContext, RepositoryError, RepositoryResult, HISTORY_TABLE, STATUS_TABLE};
pub use status::StatusRepository;
