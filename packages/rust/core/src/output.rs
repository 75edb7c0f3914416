//! CSV output: column mapping, append-only writer, and resume bookkeeping.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::debug;

use bulkmapper_shared::{
    BulkMapperError, FailureKind, MappingResult, QueryOutcome, RelatedEntity, Result, scalar_text,
};

/// Output columns, in file order.
pub const CSV_COLUMNS: [&str; 22] = [
    "Original Input",
    "Date & Time",
    "Company Name",
    "Alias 1",
    "Alias 2",
    "Alias 3",
    "All Aliases",
    "Confidence Level",
    "Confidence",
    "Ticker",
    "Exchange",
    "Majority Owner",
    "FIGI",
    "Related Entity 1 Name",
    "Related Entity 1 Score",
    "Related Entity 2 Name",
    "Related Entity 2 Score",
    "Related Entity 3 Name",
    "Related Entity 3 Score",
    "All Related Entities",
    "Alternative Company Matches",
    "Websites",
];

/// Format of the `Date & Time` column.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const LIST_SEPARATOR: &str = "; ";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Flatten one outcome into a CSV row matching [`CSV_COLUMNS`].
///
/// A failure keeps its error message in the `Company Name` column.
pub fn outcome_to_row(outcome: &QueryOutcome, timestamp: &str) -> Vec<String> {
    match outcome {
        QueryOutcome::Mapped(result) => result_to_row(result, timestamp),
        QueryOutcome::Failed(failure) => {
            let mut row = vec![String::new(); CSV_COLUMNS.len()];
            row[0] = failure.input.clone();
            row[1] = timestamp.to_string();
            row[2] = failure.message.clone();
            row
        }
    }
}

fn result_to_row(result: &MappingResult, timestamp: &str) -> Vec<String> {
    let alias = |idx: usize| result.aliases.get(idx).cloned().unwrap_or_default();
    let related_name = |idx: usize| {
        result
            .related_entities
            .get(idx)
            .map(|e| e.name().to_string())
            .unwrap_or_default()
    };
    let related_score = |idx: usize| {
        result
            .related_entities
            .get(idx)
            .map(RelatedEntity::score_text)
            .unwrap_or_default()
    };
    let all_related: Vec<&str> = result.related_entities.iter().map(RelatedEntity::name).collect();

    vec![
        result.original_input.clone(),
        timestamp.to_string(),
        result.company_name.clone().unwrap_or_default(),
        alias(0),
        alias(1),
        alias(2),
        result.aliases.join(LIST_SEPARATOR),
        scalar_text(result.confidence_level.as_ref()),
        scalar_text(result.confidence.as_ref()),
        scalar_text(result.ticker.as_ref()),
        scalar_text(result.exchange.as_ref()),
        scalar_text(result.majority_owner.as_ref()),
        scalar_text(result.figi.as_ref()),
        related_name(0),
        related_score(0),
        related_name(1),
        related_score(1),
        related_name(2),
        related_score(2),
        all_related.join(LIST_SEPARATOR),
        result.alternative_matches.join(LIST_SEPARATOR),
        result.websites.join(LIST_SEPARATOR),
    ]
}

// ---------------------------------------------------------------------------
// Paths & resume
// ---------------------------------------------------------------------------

/// `<input dir>/<input stem>-<YYYY-MM-DD>.csv`
pub fn default_output_path(input: &Path, date: NaiveDate) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir = input.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{stem}-{date}.csv"))
}

/// Inputs already present in an earlier run's output file.
///
/// Rows whose `Company Name` holds a timeout or rate-limit error are left
/// out, so a resumed run retries them. A missing file yields an empty set.
pub fn load_processed_inputs(path: &Path) -> Result<HashSet<String>> {
    let mut processed = HashSet::new();

    if !path.exists() {
        return Ok(processed);
    }

    let bytes = std::fs::read(path).map_err(|e| BulkMapperError::io(path, e))?;
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);

    let mut capacity_failures = 0usize;

    for record in reader.records() {
        let record = record.map_err(|e| BulkMapperError::csv(path, e))?;

        let Some(input) = record.get(0).filter(|v| !v.is_empty()) else {
            continue;
        };

        let company = record.get(2).unwrap_or("");
        if FailureKind::classify_message(company).is_some_and(|k| k.is_capacity()) {
            capacity_failures += 1;
            continue;
        }

        processed.insert(input.to_string());
    }

    debug!(
        path = %path.display(),
        processed = processed.len(),
        capacity_failures,
        "loaded processed inputs"
    );

    Ok(processed)
}

// ---------------------------------------------------------------------------
// CsvSink
// ---------------------------------------------------------------------------

/// Append-only CSV writer for results.
pub struct CsvSink {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows_written: usize,
}

impl CsvSink {
    /// Open `path` for appending, creating parent directories as needed.
    ///
    /// The header row (preceded by a UTF-8 BOM when `bom` is set) is written
    /// only if the file is new or empty.
    pub fn open(path: &Path, bom: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BulkMapperError::io(parent, e))?;
        }

        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BulkMapperError::io(path, e))?;

        if needs_header && bom {
            file.write_all(UTF8_BOM).map_err(|e| BulkMapperError::io(path, e))?;
        }

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        if needs_header {
            writer
                .write_record(CSV_COLUMNS)
                .map_err(|e| BulkMapperError::csv(path, e))?;
            writer.flush().map_err(|e| BulkMapperError::io(path, e))?;
            debug!(path = %path.display(), "wrote CSV header");
        }

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            rows_written: 0,
        })
    }

    pub fn write_outcome(&mut self, outcome: &QueryOutcome, timestamp: &str) -> Result<()> {
        self.writer
            .write_record(outcome_to_row(outcome, timestamp))
            .map_err(|e| BulkMapperError::csv(&self.path, e))?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| BulkMapperError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this sink (excluding the header).
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}
