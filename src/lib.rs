//! Document to PDF conversion service.
//!
//! Each request becomes a job that is staged on local disk, converted by a
//! disposable per-job worker (a conversion-engine subprocess or a fresh
//! container), uploaded to object storage, and cleaned up whatever happened.
//! A batch client drives many such jobs against a server with bounded
//! concurrency and retries.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod formats;
pub mod job;
pub mod orchestrator;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use error::{ConfigError, ConvertError};
