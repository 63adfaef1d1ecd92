//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → Log output (stdout, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields, not formatted strings, for anything a machine reads
//! - Connection id span on every per-connection task
//! - Metrics are cheap when no exporter is installed (no-op recorder)

pub mod logging;
pub mod metrics;
