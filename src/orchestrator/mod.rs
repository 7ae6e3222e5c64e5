//! Job orchestration: the ingress API, the per-job pipeline and the internal
//! file bridge.
//!
//! ```text
//!             public                         internal (workers only)
//!   ┌─────────────────────────┐          ┌──────────────────────────┐
//!   │ IngressApi  :7758       │          │ TempFileBridge  :7759    │
//!   │  /health                │          │  /temp/{job}/{file}      │
//!   │  /get_supported_...     │          │  ?token=<per-job token>  │
//!   │  /convert ──┐           │          └────────────▲─────────────┘
//!   └─────────────┼───────────┘                       │ register
//!                 ▼                                   │
//!         JobOrchestrator::submit ────────────────────┘
//!           stage → acquire → convert → upload → cleanup
//! ```

pub mod api;
pub mod auth;
pub mod bridge;
pub mod runner;
pub mod server;

pub use api::IngressApi;
pub use auth::TokenStore;
pub use bridge::{BridgeError, BridgeTicket, TempFileBridge};
pub use runner::{JobOrchestrator, JobReport};
pub use server::HttpServer;
