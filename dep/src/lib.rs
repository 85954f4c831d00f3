//! # KOA Data Evaluation and Processing
//!
//! Processing backend for the Keck Observatory Archive. Raw instrument files
//! are assigned to observing programs, checked, renamed to KOAIDs, annotated
//! with archive metadata and handed to the archive for ingestion.
//!
//! ## Architecture
//!
//! - [`models`]: status rows, programs, observations, KOAIDs and semesters
//! - [`parsing`]: the flat files exchanged with the header extraction step
//! - [`fits`]: primary header cards of a FITS file
//! - [`db`]: the status store, repository pattern and persistence layer
//! - [`services`]: program assignment, the processing pipeline, dispatcher,
//!   archive transfer and the error digest
//! - [`config`]: `dep.toml` settings

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod config;
pub mod db;
pub mod fits;
pub mod models;
pub mod parsing;
pub mod services;
