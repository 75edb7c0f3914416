//! Shared types, error model, and configuration for bulkmapper.
//!
//! This crate is the foundation depended on by all other bulkmapper crates.
//! It provides:
//! - [`BulkMapperError`]: the unified error type
//! - Domain types ([`Endpoint`], [`MappingInput`], [`MappingResult`], [`QueryOutcome`])
//! - Configuration ([`AppConfig`], [`ClientConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    ApiConfig, AppConfig, ClientConfig, DecreasePolicy, DefaultsConfig, FailureHandlingConfig,
    MAX_NUM_RETRIES, MAX_NUM_THREADS, MAX_TIMEOUT_SECS, clamp_to_max, config_dir,
    config_file_path, init_config, load_config, load_config_from, parse_base_url,
    resolve_api_key,
};
pub use error::{BulkMapperError, Result};
pub use types::{
    CleanupLevel, Endpoint, FailureKind, MappingInput, MappingResult, QueryFailure, QueryOutcome,
    RelatedEntity, scalar_text,
};
