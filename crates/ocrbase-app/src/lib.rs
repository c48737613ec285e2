//! ocrbase: an asynchronous document processing pipeline.
//!
//! Documents come in as uploads or URLs, OCR turns them into markdown,
//! and extract jobs project that markdown into caller-defined JSON via an
//! LLM. The pipeline is at-least-once with idempotent terminal writes;
//! realtime subscribers reconcile against job snapshots.

pub mod cli;
pub mod config;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod server;
pub mod services;

pub use error::AppError;
