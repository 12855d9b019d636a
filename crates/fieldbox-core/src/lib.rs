//! fieldbox-core: crash-resilient outbox for device telemetry
//!
//! A durable store-and-forward queue for sensor payloads captured on
//! devices with intermittent connectivity. Producers enqueue opaque
//! payloads into a SQLite-backed outbox; a background coordinator
//! batches them per stream, posts them to an ingestion endpoint, and
//! survives crashes, credential outages, and server brownouts without
//! losing data.
//!
//! # Architecture
//!
//! ```text
//! producers → OutboxStore (SQLite) → UploadCoordinator → Transport → ingest
//!                                         ↑ ↓
//!                            NetworkQualityOracle / CircuitBreaker
//! ```
//!
//! # Modules
//!
//! - `store`: durable outbox queue with backpressure and cleanup
//! - `coordinator`: timers, batching, and failure routing
//! - `transport`: HTTP client and the upload error taxonomy
//! - `breaker`: consecutive-failure circuit breaker
//! - `combine`: per-stream payload combiners
//! - `oracle`: batch-size advice seam
//! - `config`: TOML configuration and the provider seam
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod breaker;
pub mod combine;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod oracle;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
