//! # docflow
//!
//! Coordination layer for asynchronous, multi-step document analysis.
//!
//! A project is a folder of raw documents. A trigger fans the project out
//! into one work item per document; each work item is analyzed by an
//! external collaborator, parsed into JSON and persisted at a canonical
//! path. After every persisted result the completion detector compares the
//! raw listing with the result listing and, once nothing is missing, runs
//! the aggregation step under an advisory lock, at most once per project.
//!
//! ## Architecture
//!
//! ```text
//!  trigger ──▶ ┌────────────┐   work items   ┌───────────┐
//!              │ Dispatcher │ ─────────────▶ │   Queue   │
//!              └────────────┘                └─────┬─────┘
//!                                                  ▼
//!  ┌──────────┐  analyze   ┌───────────┐  persist  ┌───────────┐
//!  │ Analyzer │ ◀───────── │ Processor │ ────────▶ │ BlobStore │
//!  └──────────┘            └─────┬─────┘           └─────┬─────┘
//!                                ▼                       │ listings, markers
//!                          ┌───────────┐ ◀───────────────┘
//!                          │ Finalizer │ ──▶ Aggregator (once)
//!                          └─────┬─────┘
//!                                └──▶ requeue missing documents
//! ```
//!
//! Workers share nothing but storage. Completion is recomputed from
//! listings on every call and marker blobs are the only persisted state.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Trigger messages, work items, results |
//! | [`paths`] | Blob path layout and stem normalization |
//! | [`storage`] | `BlobStore` trait with memory, local and S3 backends |
//! | [`parser`] | Extract JSON from free-form model output |
//! | [`dispatcher`] | Expand triggers into work items |
//! | [`queue`] | Batching publisher over a queue transport |
//! | [`analysis`] | Analysis collaborator and fallback strategy chain |
//! | [`notify`] | Best-effort notifications |
//! | [`aggregate`] | Aggregate index rebuild |
//! | [`finalize`] | Completion detection, lock, aggregation, requeue |
//! | [`processor`] | Per-document processing |
//! | [`pipeline`] | Component wiring and queue handlers |
//! | [`server`] | HTTP entry points |
//! | [`runner`] | Local in-process execution |
//! | [`observability`] | Logging setup |

pub mod aggregate;
pub mod analysis;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod finalize;
pub mod models;
pub mod notify;
pub mod observability;
pub mod parser;
pub mod paths;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod runner;
pub mod server;
pub mod storage;

pub use error::{Error, Result};
