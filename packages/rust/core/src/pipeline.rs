//! End-to-end bulk run: input file → batched concurrent lookups → CSV.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use bulkmapper_client::MapperClient;
use bulkmapper_shared::{
    AppConfig, BulkMapperError, ClientConfig, DecreasePolicy, FailureKind, MAX_NUM_THREADS,
    MappingInput, QueryFailure, QueryOutcome, Result, clamp_to_max,
};

use crate::controller::ConcurrencyController;
use crate::input::{self, TextEncoding};
use crate::output::{self, CsvSink, DATE_FORMAT};

/// Configuration for [`run_bulk`].
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// File with one input per row.
    pub input_path: PathBuf,
    /// Output CSV; defaults to `<input stem>-<date>.csv` next to the input.
    pub output_path: Option<PathBuf>,
    /// Input encoding override. Detected from the file when `None`.
    pub input_encoding: Option<TextEncoding>,
    /// Re-process inputs already present in the output file.
    pub force: bool,
    /// Concurrency ceiling, also the batch size.
    pub num_threads: usize,
    /// Sleep after a batch attempt hit the rate limit.
    pub rate_limit_pause: Duration,
    /// Clean batches needed before concurrency grows.
    pub grow_after: u32,
    pub decrease_policy: DecreasePolicy,
    /// Prefix a newly created output file with a UTF-8 BOM.
    pub output_bom: bool,
    pub client: ClientConfig,
}

impl BulkConfig {
    /// Build from the config file's defaults; callers override fields from flags.
    pub fn from_app(config: &AppConfig, input_path: impl Into<PathBuf>, client: ClientConfig) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: None,
            input_encoding: None,
            force: false,
            num_threads: clamp_to_max("number of threads", config.defaults.num_threads.max(1), MAX_NUM_THREADS)
                as usize,
            rate_limit_pause: Duration::from_millis(config.failure_handling.rate_limit_pause_ms),
            grow_after: config.failure_handling.grow_after,
            decrease_policy: config.failure_handling.decrease_policy,
            output_bom: false,
            client,
        }
    }
}

/// Result of a bulk run.
#[derive(Debug)]
pub struct BulkSummary {
    pub output_path: PathBuf,
    /// Inputs read from the input file.
    pub total_inputs: usize,
    /// Inputs skipped because the output already had them.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Concurrency limit when the run finished.
    pub final_concurrency: usize,
    pub elapsed: Duration,
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before a batch is submitted for the first time.
    fn batch_started(&self, batch: usize, size: usize, concurrency: usize);
    /// Called after a batch was written. `remaining` counts inputs not yet submitted.
    fn rows_written(&self, written: usize, remaining: usize);
    /// Called when the run completes.
    fn done(&self, summary: &BulkSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn batch_started(&self, _batch: usize, _size: usize, _concurrency: usize) {}
    fn rows_written(&self, _written: usize, _remaining: usize) {}
    fn done(&self, _summary: &BulkSummary) {}
}

/// An outcome and the local time it arrived.
type Stamped = (QueryOutcome, String);

/// Run a bulk mapping job.
///
/// 1. Load inputs
/// 2. Drop inputs already in the output file (unless forced)
/// 3. Submit batches with adaptive concurrency
/// 4. Append each batch to the output CSV
///
/// An invalid API key aborts the run with [`BulkMapperError::Auth`]; rows
/// from earlier batches stay in the output file.
#[instrument(skip_all, fields(input = %config.input_path.display(), endpoint = %config.client.endpoint))]
pub async fn run_bulk(config: &BulkConfig, progress: &dyn ProgressReporter) -> Result<BulkSummary> {
    let start = Instant::now();

    let output_path = config.output_path.clone().unwrap_or_else(|| {
        output::default_output_path(&config.input_path, Local::now().date_naive())
    });

    // --- Phase 1: Inputs ---
    progress.phase("Reading input file");
    let inputs = input::load_inputs(&config.input_path, config.input_encoding)?;
    let total_inputs = inputs.len();

    // --- Phase 2: Resume ---
    let pending: Vec<MappingInput> = if config.force {
        inputs
    } else {
        let processed = output::load_processed_inputs(&output_path)?;
        let remaining: Vec<MappingInput> = inputs
            .into_iter()
            .filter(|i| !processed.contains(&i.value))
            .collect();

        let skipped = total_inputs - remaining.len();
        if skipped > 0 {
            info!(
                skipped,
                remaining = remaining.len(),
                output = %output_path.display(),
                "skipping rows already in output file, resuming"
            );
        }
        remaining
    };
    let skipped = total_inputs - pending.len();

    let num_threads = config.num_threads.max(1);
    let mut controller =
        ConcurrencyController::new(num_threads, config.grow_after, config.decrease_policy);

    if pending.is_empty() {
        if total_inputs == 0 {
            warn!(input = %config.input_path.display(), "input file has no rows, nothing to do");
        } else {
            info!(output = %output_path.display(), "all rows were already processed");
        }
        let summary = BulkSummary {
            output_path,
            total_inputs,
            skipped,
            succeeded: 0,
            failed: 0,
            final_concurrency: controller.current(),
            elapsed: start.elapsed(),
        };
        progress.done(&summary);
        return Ok(summary);
    }

    // --- Phase 3: Query ---
    progress.phase("Querying Mapper API");
    let client = MapperClient::new(config.client.clone())?;
    let mut sink = CsvSink::open(&output_path, config.output_bom)?;

    info!(
        rows = pending.len(),
        threads = num_threads,
        output = %output_path.display(),
        "starting bulk run"
    );

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut remaining = pending.len();

    for (idx, batch) in pending.chunks(num_threads).enumerate() {
        progress.batch_started(idx + 1, batch.len(), controller.current());

        let (rows, had_capacity_failure) =
            process_batch(&client, &mut controller, batch.to_vec(), config.rate_limit_pause).await?;
        controller.finish_batch(had_capacity_failure);

        for (outcome, timestamp) in &rows {
            if outcome.is_failure() {
                failed += 1;
            } else {
                succeeded += 1;
            }
            sink.write_outcome(outcome, timestamp)?;
        }
        sink.flush()?;

        remaining -= batch.len();
        info!(
            written = rows.len(),
            remaining,
            output = %output_path.display(),
            "wrote batch"
        );
        progress.rows_written(sink.rows_written(), remaining);
    }

    let summary = BulkSummary {
        output_path,
        total_inputs,
        skipped,
        succeeded,
        failed,
        final_concurrency: controller.current(),
        elapsed: start.elapsed(),
    };

    progress.done(&summary);

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        final_concurrency = summary.final_concurrency,
        elapsed_ms = summary.elapsed.as_millis(),
        "bulk run complete"
    );

    Ok(summary)
}

/// Submit one batch until every item has a final outcome.
///
/// Items that hit a capacity failure are re-submitted, up to the controller's
/// attempt budget; after that their error rows are kept. Returns the stamped
/// outcomes and whether any capacity failure occurred.
async fn process_batch(
    client: &MapperClient,
    controller: &mut ConcurrencyController,
    batch: Vec<MappingInput>,
    rate_limit_pause: Duration,
) -> Result<(Vec<Stamped>, bool)> {
    let attempts = controller.max_batch_attempts();
    let mut pending = batch;
    let mut done: Vec<Stamped> = Vec::with_capacity(pending.len());
    let mut had_capacity_failure = false;

    for attempt in 1..=attempts {
        let results = fan_out(client, &pending, controller.current()).await;

        let mut retry: Vec<(MappingInput, Stamped)> = Vec::new();
        let mut rate_limited = false;
        let mut timed_out = false;

        for (input, outcome, timestamp) in results {
            match outcome.failure_kind() {
                Some(FailureKind::Unauthorized) => {
                    let message = match outcome {
                        QueryOutcome::Failed(failure) => failure.message,
                        QueryOutcome::Mapped(_) => String::new(),
                    };
                    return Err(BulkMapperError::Auth(message));
                }
                Some(FailureKind::RateLimited) => {
                    rate_limited = true;
                    retry.push((input, (outcome, timestamp)));
                }
                Some(FailureKind::Timeout) => {
                    timed_out = true;
                    retry.push((input, (outcome, timestamp)));
                }
                _ => done.push((outcome, timestamp)),
            }
        }

        if retry.is_empty() {
            break;
        }
        had_capacity_failure = true;

        if rate_limited {
            controller.record_failure(FailureKind::RateLimited);
        }
        if timed_out {
            controller.record_failure(FailureKind::Timeout);
        }

        if attempt == attempts {
            warn!(
                attempts,
                failed = retry.len(),
                "batch attempts exhausted, keeping error rows"
            );
            done.extend(retry.into_iter().map(|(_, stamped)| stamped));
            break;
        }

        debug!(
            attempt,
            retrying = retry.len(),
            concurrency = controller.current(),
            "re-submitting failed items"
        );

        if rate_limited {
            pause_after_rate_limit(attempt, attempts, rate_limit_pause).await;
        }

        pending = retry.into_iter().map(|(input, _)| input).collect();
    }

    Ok((done, had_capacity_failure))
}

/// Sleep for `pause` unless `attempt` was the last one. Returns whether it slept.
async fn pause_after_rate_limit(attempt: u32, attempts: u32, pause: Duration) -> bool {
    if attempt >= attempts || pause.is_zero() {
        return false;
    }

    warn!(
        pause_ms = pause.as_millis() as u64,
        "rate limit reached, pausing"
    );
    tokio::time::sleep(pause).await;
    true
}

/// Query every input with at most `limit` requests in flight.
async fn fan_out(
    client: &MapperClient,
    inputs: &[MappingInput],
    limit: usize,
) -> Vec<(MappingInput, QueryOutcome, String)> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(inputs.len());

    for input in inputs {
        let client = client.clone();
        let sem = semaphore.clone();
        let input = input.clone();

        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await;
            let outcome = client.query(&input).await;
            let timestamp = Local::now().format(DATE_FORMAT).to_string();
            (outcome, timestamp)
        }));
    }

    let mut results = Vec::with_capacity(inputs.len());
    for (input, handle) in inputs.iter().zip(handles) {
        match handle.await {
            Ok((outcome, timestamp)) => results.push((input.clone(), outcome, timestamp)),
            Err(e) => {
                warn!(input = %input.value, error = %e, "query task failed");
                let outcome = QueryOutcome::Failed(QueryFailure {
                    input: input.value.clone(),
                    kind: FailureKind::Other,
                    message: format!("Query task failed: {e}"),
                });
                let timestamp = Local::now().format(DATE_FORMAT).to_string();
                results.push((input.clone(), outcome, timestamp));
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bulkmapper_shared::{CleanupLevel, Endpoint};
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            endpoint: Endpoint::MerchantMapper,
            api_key: "test-key".into(),
            timeout: Duration::from_secs(5),
            num_retries: 1,
            retry_interval: Duration::ZERO,
            cleanup: CleanupLevel::High,
            type_hint: None,
            companies_only: false,
            support_email: "support@example.com".into(),
        }
    }

    fn bulk_config(server: &MockServer, dir: &Path, inputs: &str, threads: usize) -> BulkConfig {
        let input_path = dir.join("inputs.txt");
        std::fs::write(&input_path, inputs).unwrap();

        BulkConfig {
            input_path,
            output_path: Some(dir.join("out.csv")),
            input_encoding: None,
            force: false,
            num_threads: threads,
            rate_limit_pause: Duration::ZERO,
            grow_after: 1,
            decrease_policy: DecreasePolicy::Step,
            output_bom: false,
            client: client_config(server),
        }
    }

    fn mapped() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!([{
            "Original Input": "whatever",
            "Company Name": "Acme Corp",
            "Aliases": ["Acme"]
        }]))
    }

    fn output_inputs(path: &Path) -> Vec<String> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .unwrap();
        let mut values: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().get(0).unwrap().to_string())
            .collect();
        values.sort();
        values
    }

    #[tokio::test]
    async fn full_run_writes_one_row_per_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/merchant-mapper"))
            .respond_with(mapped())
            .expect(5)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "a\nb\nc\nd\ne\n", 2);

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.total_inputs, 5);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.final_concurrency, 2);
        assert_eq!(output_inputs(&summary.output_path), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn resume_skips_processed_and_retries_capacity_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "alpha\nbeta\ngamma\n", 4);

        let out = config.output_path.clone().unwrap();
        std::fs::write(
            &out,
            "Original Input,Date & Time,Company Name\n\
             alpha,2024-01-01 00:00:00,Alpha Inc\n\
             beta,2024-01-01 00:00:00,API response error: 504 Gateway Time-out for inputs [\"beta\"].\n",
        )
        .unwrap();

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(output_inputs(&out), vec!["alpha", "beta", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn force_reprocesses_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = bulk_config(&server, dir.path(), "alpha\nbeta\ngamma\n", 4);
        config.force = true;

        let out = config.output_path.clone().unwrap();
        std::fs::write(
            &out,
            "Original Input,Date & Time,Company Name\nalpha,2024-01-01 00:00:00,Alpha Inc\n",
        )
        .unwrap();

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(output_inputs(&out), vec!["alpha", "alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn nothing_left_makes_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "alpha\n", 4);
        std::fs::write(
            config.output_path.as_ref().unwrap(),
            "Original Input,Date & Time,Company Name\nalpha,2024-01-01 00:00:00,Alpha Inc\n",
        )
        .unwrap();

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded + summary.failed, 0);
    }

    #[tokio::test]
    async fn rate_limit_shrinks_concurrency_and_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "a\nb\nc\nd\n", 4);

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.final_concurrency, 3);
        assert_eq!(output_inputs(&summary.output_path).len(), 4);
    }

    #[tokio::test]
    async fn unauthorized_aborts_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "a\nb\n", 2);

        let err = run_bulk(&config, &SilentProgress).await.unwrap_err();
        assert!(matches!(err, BulkMapperError::Auth(_)));
        assert!(output_inputs(config.output_path.as_ref().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn persistent_timeouts_exhaust_batch_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["slow"])))
            .respond_with(ResponseTemplate::new(504))
            .expect(12)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "slow\n", 1);

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.final_concurrency, 1);
        assert_eq!(output_inputs(&summary.output_path), vec!["slow"]);
    }

    #[tokio::test]
    async fn empty_input_file_makes_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "\n  \n", 4);

        let summary = run_bulk(&config, &SilentProgress).await.unwrap();
        assert_eq!(summary.total_inputs, 0);
        assert_eq!(summary.skipped, 0);
        assert!(!summary.output_path.exists());
    }

    #[tokio::test]
    async fn fan_out_caps_requests_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(mapped().set_delay(Duration::from_millis(200)))
            .expect(6)
            .mount(&server)
            .await;

        let client = MapperClient::new(client_config(&server)).unwrap();
        let inputs: Vec<MappingInput> = ["a", "b", "c", "d", "e", "f"]
            .into_iter()
            .map(MappingInput::new)
            .collect();

        // Two at a time means three rounds of 200ms.
        let started = Instant::now();
        let results = fan_out(&client, &inputs, 2).await;
        assert!(started.elapsed() >= Duration::from_millis(600));

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|(_, outcome, _)| !outcome.is_failure()));
        let sent: Vec<&str> = results.iter().map(|(i, _, _)| i.value.as_str()).collect();
        assert_eq!(sent, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn resubmission_runs_under_lowered_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(504))
            .up_to_n_times(4)
            .expect(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(mapped().set_delay(Duration::from_millis(200)))
            .expect(4)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = bulk_config(&server, dir.path(), "a\nb\nc\nd\n", 4);

        // After the timeouts the limit is 3, so four retries need two rounds.
        let started = Instant::now();
        let summary = run_bulk(&config, &SilentProgress).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.final_concurrency, 3);
    }

    #[tokio::test]
    async fn rate_limit_pauses_before_resubmitting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(mapped())
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = bulk_config(&server, dir.path(), "a\n", 1);
        config.rate_limit_pause = Duration::from_millis(300);

        let started = Instant::now();
        let summary = run_bulk(&config, &SilentProgress).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_pause_skipped_after_last_attempt() {
        let pause = Duration::from_secs(15);

        let started = tokio::time::Instant::now();
        assert!(pause_after_rate_limit(1, 12, pause).await);
        let slept = started.elapsed();
        assert!(slept >= pause && slept < pause + Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        assert!(!pause_after_rate_limit(12, 12, pause).await);
        assert!(!pause_after_rate_limit(3, 12, Duration::ZERO).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn from_app_clamps_threads() {
        let mut app = AppConfig::default();
        app.defaults.num_threads = 50;
        let client = ClientConfig::from_app(&app, "key").unwrap();

        let config = BulkConfig::from_app(&app, "inputs.txt", client);
        assert_eq!(config.num_threads, 8);
        assert_eq!(config.rate_limit_pause, Duration::from_secs(15));
        assert!(!config.force);
    }
}
