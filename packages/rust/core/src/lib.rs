//! Bulk mapping engine for bulkmapper.
//!
//! This crate ties the Mapper API client to file I/O:
//! - [`input`]: reading and decoding input files
//! - [`controller`]: the adaptive concurrency limit
//! - [`pipeline`]: the end-to-end bulk run ([`run_bulk`])
//! - [`output`]: CSV rows, the append-only sink, and resume bookkeeping

pub mod controller;
pub mod input;
pub mod output;
pub mod pipeline;

pub use controller::ConcurrencyController;
pub use input::{MAX_INPUT_LENGTH, TextEncoding, load_inputs};
pub use output::{CSV_COLUMNS, CsvSink, default_output_path, load_processed_inputs};
pub use pipeline::{BulkConfig, BulkSummary, ProgressReporter, SilentProgress, run_bulk};
