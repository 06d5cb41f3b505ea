//! Batch migration from an S3-compatible object store into a
//! content-addressed allocation store.
//!
//! Objects already present on the destination are skipped, everything else
//! is staged locally (or streamed), uploaded with integrity checks, optionally
//! committed, and cleaned up. Failures of single objects never stop the run.

pub mod config;
pub mod destination;
pub mod error;
pub mod index;
pub mod migrate;
pub mod source;
pub mod staging;
pub mod upload;

pub use config::{MigrationConfig, ReadPayer, StagingStrategy};
pub use migrate::{MigrationReport, Migrator, ObjectOutcome};
