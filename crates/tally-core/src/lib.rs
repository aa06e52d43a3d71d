//! tally-core library.
//!
//! Data model, CRDT document, persistence bridge, migration engine, and
//! access policy for the tally expense-ledger sync engine. This crate has
//! no network I/O; everything here can be exercised in plain unit tests.
//!
//! # Conventions
//!
//! - **Errors**: library enums use `thiserror`; `anyhow::Result` with
//!   `.context(...)` at persistence seams.
//! - **Logging**: use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod balance;
pub mod clock;
pub mod crdt;
pub mod doc;
pub mod error;
pub mod migrate;
pub mod model;
pub mod op;
pub mod policy;
pub mod store;

pub use error::SyncError;
