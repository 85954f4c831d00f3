//! Service layer.
//!
//! Services sit between the status store and the runner binary: program
//! assignment for a night, the per-file processing pipeline, the queue
//! dispatcher that feeds it, archive transfer, and the error digest.

pub mod digest;
pub mod directory;
pub mod dispatcher;
pub mod pipeline;
pub mod program_assigner;
pub mod transport;

pub use digest::{CollectingNotifier, DigestOutcome, ErrorDigest, LogNotifier, Notifier};
pub use directory::{ApiProgramDirectory, CachingDirectory, ProgramDirectory, StaticDirectory};
pub use dispatcher::{DispatchError, Dispatcher, Submission};
pub use pipeline::{Pipeline, RunOutcome, RunRequest, StepError};
pub use program_assigner::{AssignError, AssignmentReport, HeaderProgMode, ProgramAssigner};
pub use transport::{
    HttpIngestNotifier, IngestNotifier, IngestRequest, RecordingTransport, RsyncTransport,
    TransferError, Transport,
};
