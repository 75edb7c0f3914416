//! Mapper API client: one POST per input, retried on transient failures.

use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::{debug, instrument, warn};
use url::Url;

use bulkmapper_shared::{
    BulkMapperError, ClientConfig, Endpoint, FailureKind, MappingInput, MappingResult,
    QueryFailure, QueryOutcome, Result,
};

use crate::backoff::retry_delay;

/// User-Agent string for Mapper API requests.
const USER_AGENT: &str = concat!("bulkmapper/", env!("CARGO_PKG_VERSION"));

/// Query parameter carrying the API key.
const KEY_PARAM: &str = "X_User_Key";

const TYPE_HINT_HEADER: &str = "X-Type-Hint";
const CLEAN_INPUT_HEADER: &str = "X-Clean-Input";
const INPUT_TYPE_HEADER: &str = "X-Input-Type";

// ---------------------------------------------------------------------------
// MapperClient
// ---------------------------------------------------------------------------

/// HTTP client for a single Mapper API endpoint.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct MapperClient {
    config: ClientConfig,
    client: Client,
    url: Url,
}

/// A failed attempt, before deciding whether to retry.
struct AttemptError {
    kind: FailureKind,
    message: String,
}

impl MapperClient {
    /// Create a new client for the configured endpoint.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| BulkMapperError::Network(format!("failed to build HTTP client: {e}")))?;

        let url = endpoint_url(&config.base_url, config.endpoint)?;

        Ok(Self {
            config,
            client,
            url,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Look up one input, retrying transport errors, timeouts and 5xx
    /// responses up to the configured number of attempts.
    ///
    /// Never returns an error: every failure is folded into
    /// [`QueryOutcome::Failed`] so it can be written out as a CSV row.
    #[instrument(skip_all, fields(input = %input.value))]
    pub async fn query(&self, input: &MappingInput) -> QueryOutcome {
        if input.value.trim().is_empty() {
            return QueryOutcome::Failed(QueryFailure {
                input: input.value.clone(),
                kind: FailureKind::Rejected,
                message: "Empty input".to_string(),
            });
        }

        let hint = input.hint.as_deref().or(self.config.type_hint.as_deref());
        let attempts = self.config.num_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(attempt, "retrying request");
            }

            match self.send_once(&input.value, hint).await {
                Ok(mut result) => {
                    // Keep the exact value we sent so resumed runs can match it.
                    result.original_input = input.value.clone();
                    return QueryOutcome::Mapped(result);
                }
                Err(e) if !e.kind.is_retryable() => {
                    debug!(kind = ?e.kind, error = %e.message, "request failed, not retrying");
                    return self.failed(input, e);
                }
                Err(e) => {
                    debug!(attempt, kind = ?e.kind, error = %e.message, "request failed");
                    if attempt < attempts {
                        let wait = retry_delay(self.config.retry_interval, attempt);
                        debug!(wait_ms = wait.as_millis() as u64, "waiting before another attempt");
                        tokio::time::sleep(wait).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| AttemptError {
            kind: FailureKind::Other,
            message: "no attempt was made".to_string(),
        });
        warn!(
            attempts,
            error = %error.message,
            "could not process input, contact {} if this problem persists",
            self.config.support_email
        );
        self.failed(input, error)
    }

    fn failed(&self, input: &MappingInput, error: AttemptError) -> QueryOutcome {
        QueryOutcome::Failed(QueryFailure {
            input: input.value.clone(),
            kind: error.kind,
            message: error.message,
        })
    }

    async fn send_once(
        &self,
        value: &str,
        hint: Option<&str>,
    ) -> std::result::Result<MappingResult, AttemptError> {
        let payload = [value];

        let mut request = self
            .client
            .post(self.url.clone())
            .query(&[(KEY_PARAM, self.config.api_key.as_str())])
            .header(ACCEPT, "application/json")
            .header(CLEAN_INPUT_HEADER, self.config.cleanup.as_str())
            .json(&payload);

        if let Some(hint) = hint {
            request = request.header(TYPE_HINT_HEADER, hint);
        }
        if self.config.companies_only && self.config.endpoint == Endpoint::MerchantMapper {
            request = request.header(INPUT_TYPE_HEADER, "company name");
        }

        let response = request.send().await.map_err(|e| self.request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let inputs = serde_json::to_string(&payload).unwrap_or_default();
            return Err(AttemptError {
                kind: FailureKind::from_status(status.as_u16()),
                message: format!(
                    "API response error: {} {} for inputs {inputs}. {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown"),
                    self.contact_hint()
                ),
            });
        }

        let mut results: Vec<MappingResult> =
            response.json().await.map_err(|e| self.request_error(&e))?;

        if results.is_empty() {
            return Err(AttemptError {
                kind: FailureKind::Other,
                message: format!("API response error: empty result list. {}", self.contact_hint()),
            });
        }

        Ok(results.swap_remove(0))
    }

    fn request_error(&self, e: &reqwest::Error) -> AttemptError {
        if e.is_timeout() {
            AttemptError {
                kind: FailureKind::Timeout,
                message: format!(
                    "API request error: Read timed out after {}s. {}",
                    self.config.timeout.as_secs(),
                    self.contact_hint()
                ),
            }
        } else {
            AttemptError {
                kind: FailureKind::Other,
                message: format!("API request error: {e}. {}", self.contact_hint()),
            }
        }
    }

    fn contact_hint(&self) -> String {
        format!(
            "Please contact {} for help if this problem persists.",
            self.config.support_email
        )
    }
}

/// Full URL of an endpoint under the API base URL.
pub fn endpoint_url(base_url: &Url, endpoint: Endpoint) -> Result<Url> {
    let base = base_url.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/{}", endpoint.path()))
        .map_err(|e| BulkMapperError::config(format!("invalid endpoint URL: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulkmapper_shared::CleanupLevel;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            endpoint: Endpoint::MerchantMapper,
            api_key: "test-key".into(),
            timeout: Duration::from_secs(5),
            num_retries: 2,
            retry_interval: Duration::ZERO,
            cleanup: CleanupLevel::High,
            type_hint: None,
            companies_only: false,
            support_email: "support@example.com".into(),
        }
    }

    fn amazon() -> serde_json::Value {
        json!([{
            "Original Input": "amzn mktp",
            "Company Name": "Amazon.com Inc",
            "Aliases": ["Amazon"],
            "Ticker": "AMZN"
        }])
    }

    #[test]
    fn endpoint_url_joins_path() {
        let base = Url::parse("https://api.example.com/").unwrap();
        let url = endpoint_url(&base, Endpoint::DomainMapper).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/domain-mapper");
    }

    #[tokio::test]
    async fn query_sends_expected_request() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/merchant-mapper"))
            .and(query_param("X_User_Key", "test-key"))
            .and(header("X-Clean-Input", "high"))
            .and(header("Accept", "application/json"))
            .and(body_json(json!(["amzn mktp"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(amazon()))
            .expect(1)
            .mount(&server)
            .await;

        let client = MapperClient::new(test_config(&server)).unwrap();
        let outcome = client.query(&MappingInput::new("amzn mktp")).await;

        match outcome {
            QueryOutcome::Mapped(result) => {
                assert_eq!(result.original_input, "amzn mktp");
                assert_eq!(result.company_name.as_deref(), Some("Amazon.com Inc"));
            }
            other => panic!("expected mapped result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn row_hint_overrides_global_hint() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("X-Type-Hint", "retail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(amazon()))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.type_hint = Some("company".into());
        let client = MapperClient::new(config).unwrap();

        let outcome = client
            .query(&MappingInput::new("amzn mktp").with_hint("retail"))
            .await;
        assert!(!outcome.is_failure());
    }

    #[tokio::test]
    async fn companies_only_sets_input_type_for_merchants() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("X-Input-Type", "company name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(amazon()))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.companies_only = true;
        let client = MapperClient::new(config).unwrap();

        assert!(!client.query(&MappingInput::new("Amazon")).await.is_failure());
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = MapperClient::new(test_config(&server)).unwrap();
        let outcome = client.query(&MappingInput::new("acme")).await;

        assert_eq!(outcome.failure_kind(), Some(FailureKind::Unauthorized));
        if let QueryOutcome::Failed(failure) = outcome {
            assert!(failure.message.contains("401 Unauthorized for inputs [\"acme\"]"));
        }
    }

    #[tokio::test]
    async fn rate_limit_is_reported_without_retry() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let client = MapperClient::new(test_config(&server)).unwrap();
        let outcome = client.query(&MappingInput::new("acme")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::RateLimited));
    }

    #[tokio::test]
    async fn gateway_timeout_is_retried_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(504))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(amazon()))
            .expect(1)
            .mount(&server)
            .await;

        let client = MapperClient::new(test_config(&server)).unwrap();
        let outcome = client.query(&MappingInput::new("amzn mktp")).await;
        assert!(!outcome.is_failure());
    }

    #[tokio::test]
    async fn server_errors_exhaust_attempts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.num_retries = 3;
        let client = MapperClient::new(config).unwrap();

        let outcome = client.query(&MappingInput::new("acme")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Other));
    }

    #[tokio::test]
    async fn slow_response_is_a_timeout() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(amazon())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.timeout = Duration::from_millis(200);
        config.num_retries = 1;
        let client = MapperClient::new(config).unwrap();

        let outcome = client.query(&MappingInput::new("acme")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Timeout));
        if let QueryOutcome::Failed(failure) = outcome {
            assert_eq!(
                FailureKind::classify_message(&failure.message),
                Some(FailureKind::Timeout)
            );
        }
    }

    #[tokio::test]
    async fn empty_result_list_is_a_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.num_retries = 1;
        let client = MapperClient::new(config).unwrap();

        let outcome = client.query(&MappingInput::new("acme")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Other));
    }

    #[tokio::test]
    async fn empty_input_is_rejected_locally() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(amazon()))
            .expect(0)
            .mount(&server)
            .await;

        let client = MapperClient::new(test_config(&server)).unwrap();
        let outcome = client.query(&MappingInput::new("   ")).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Rejected));
    }
}
