//! Core domain types: mapper endpoints, inputs, API results and query outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{BulkMapperError, Result};

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Which Mapper API endpoint to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    #[default]
    #[serde(alias = "merchants")]
    MerchantMapper,
    #[serde(alias = "domains")]
    DomainMapper,
    #[serde(alias = "products")]
    ProductMapper,
}

impl Endpoint {
    /// URL path segment of the endpoint (`merchant-mapper`, ...).
    pub fn path(&self) -> &'static str {
        match self {
            Self::MerchantMapper => "merchant-mapper",
            Self::DomainMapper => "domain-mapper",
            Self::ProductMapper => "product-mapper",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Endpoint {
    type Err = BulkMapperError;

    /// Accepts both current (`merchant-mapper`) and legacy (`merchants`) names.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merchant-mapper" | "merchants" | "merchant" => Ok(Self::MerchantMapper),
            "domain-mapper" | "domains" | "domain" => Ok(Self::DomainMapper),
            "product-mapper" | "products" | "product" => Ok(Self::ProductMapper),
            other => Err(BulkMapperError::validation(format!(
                "unknown endpoint '{other}': expected merchant-mapper, domain-mapper or product-mapper"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// CleanupLevel
// ---------------------------------------------------------------------------

/// How aggressively the API should clean noisy inputs before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupLevel {
    #[default]
    High,
    Low,
}

impl CleanupLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// MappingInput
// ---------------------------------------------------------------------------

/// One raw input line, plus the optional per-row type hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInput {
    pub value: String,
    pub hint: Option<String>,
}

impl MappingInput {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ---------------------------------------------------------------------------
// MappingResult
// ---------------------------------------------------------------------------

/// One mapped entity as returned by the Mapper API.
///
/// Field names follow the API's JSON keys. Everything except the original
/// input is optional; scalar fields are kept as raw JSON because the API
/// mixes strings and numbers (e.g. `Confidence`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    #[serde(rename = "Original Input", default)]
    pub original_input: String,

    #[serde(rename = "Company Name", default)]
    pub company_name: Option<String>,

    #[serde(rename = "Aliases", default, deserialize_with = "null_as_empty")]
    pub aliases: Vec<String>,

    #[serde(rename = "Confidence Level", default)]
    pub confidence_level: Option<Value>,

    #[serde(rename = "Confidence", default)]
    pub confidence: Option<Value>,

    #[serde(rename = "Ticker", default)]
    pub ticker: Option<Value>,

    #[serde(rename = "Exchange", default)]
    pub exchange: Option<Value>,

    #[serde(rename = "Majority Owner", default)]
    pub majority_owner: Option<Value>,

    #[serde(rename = "FIGI", default)]
    pub figi: Option<Value>,

    #[serde(rename = "Related Entities", default, deserialize_with = "null_as_empty")]
    pub related_entities: Vec<RelatedEntity>,

    #[serde(
        rename = "Alternative Company Matches",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub alternative_matches: Vec<String>,

    #[serde(rename = "Websites", default, deserialize_with = "null_as_empty")]
    pub websites: Vec<String>,
}

/// A related entity: either a bare name or a name with a closeness score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelatedEntity {
    Name(String),
    Scored {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Closeness Score", default)]
        score: Option<Value>,
    },
}

impl RelatedEntity {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Scored { name, .. } => name,
        }
    }

    /// Closeness score rendered as text; empty for bare names.
    pub fn score_text(&self) -> String {
        match self {
            Self::Name(_) => String::new(),
            Self::Scored { score, .. } => scalar_text(score.as_ref()),
        }
    }
}

/// Render a scalar JSON value the way it should appear in a CSV cell.
pub fn scalar_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Query outcomes
// ---------------------------------------------------------------------------

/// Why a single lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Gateway timeout, back-end at capacity, or client-side timeout.
    Timeout,
    /// HTTP 429: the key's request quota is exhausted for now.
    RateLimited,
    /// HTTP 401: the API key is invalid.
    Unauthorized,
    /// Any other 4xx, or an input the client refused to send.
    Rejected,
    /// Transport failures, other 5xx, undecodable responses.
    Other,
}

/// Message fragments the API gateway produces for each failure class.
const TIMEOUT_MESSAGES: &[&str] = &[
    "504 Gateway Time-out",
    "504 Gateway Timeout",
    "Read timed out",
    "operation timed out",
    "503 Service Unavailable",
];
const RATE_LIMIT_MESSAGES: &[&str] = &["429 Too Many Requests"];
const UNAUTHORIZED_MESSAGES: &[&str] = &["401 Unauthorized"];

impl FailureKind {
    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            429 => Self::RateLimited,
            503 | 504 => Self::Timeout,
            400..=499 => Self::Rejected,
            _ => Self::Other,
        }
    }

    /// Classify a stored error message, e.g. a `Company Name` cell of an
    /// earlier run's error row. Returns `None` for ordinary company names.
    pub fn classify_message(message: &str) -> Option<Self> {
        let contains_any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if contains_any(UNAUTHORIZED_MESSAGES) {
            Some(Self::Unauthorized)
        } else if contains_any(RATE_LIMIT_MESSAGES) {
            Some(Self::RateLimited)
        } else if contains_any(TIMEOUT_MESSAGES) {
            Some(Self::Timeout)
        } else {
            None
        }
    }

    /// Timeouts and rate limits mean the service is over capacity; the
    /// concurrency controller backs off on these.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }

    /// Whether a single request should be retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Other)
    }
}

/// A lookup that did not produce a mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFailure {
    pub input: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of looking up one input.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Mapped(MappingResult),
    Failed(QueryFailure),
}

impl QueryOutcome {
    /// The raw input this outcome belongs to.
    pub fn input(&self) -> &str {
        match self {
            Self::Mapped(result) => &result.original_input,
            Self::Failed(failure) => &failure.input,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Mapped(_) => None,
            Self::Failed(failure) => Some(failure.kind),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
