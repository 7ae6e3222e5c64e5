//! Per-job conversion workers.
//!
//! A worker is either a conversion-engine child process or a disposable
//! Docker container running this service in subprocess mode. Workers are
//! created for one job and torn down after it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                        WorkerLifecycleManager                              │
//! │                                                                            │
//! │   acquire(job_id)                                                          │
//! │         │                                                                  │
//! │         ▼                                                                  │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐  │
//! │   │ Provision    │────▶│ Wait Ready   │────▶│ WorkerLease::convert     │  │
//! │   │ (engine or   │     │ (port + GET  │     │ (engine run or POST      │  │
//! │   │  container)  │     │  /health)    │     │  /convert with file_url) │  │
//! │   └──────────────┘     └──────────────┘     └──────────────────────────┘  │
//! │                                                        │                   │
//! │                                                        ▼                   │
//! │                                              ┌──────────────────────────┐  │
//! │                                              │ release: stop + remove   │  │
//! │                                              └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod manager;
pub mod subprocess;

pub use config::{WorkerBackend, WorkerConfig};
pub use error::WorkerError;
pub use manager::{
    ConversionOutput, ConversionRequest, Worker, WorkerEndpoint, WorkerLease,
    WorkerLifecycleManager, WorkerState, container_env,
};
pub use subprocess::EngineRunner;
