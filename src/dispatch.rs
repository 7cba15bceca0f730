//! Batch dispatcher
//!
//! Runs every input line through the per-record pipeline (preflight,
//! resolution, service call, result validation, write) under a bounded
//! worker pool. Record-level failures become error-log entries; only
//! configuration errors abort the run.

use crate::config::BatchConfig;
use crate::error::{NominaError, Result};
use crate::output::{ErrorLog, OutputWriter};
use crate::preflight::{detect_missing, enrich_region};
use crate::resolve::FieldResolver;
use crate::schema::CompiledSchema;
use crate::service::ComputeService;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Per-record partition of one finished batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// One input line: either a parsed record or the reason it would not parse.
type ParsedLine = (usize, std::result::Result<Value, String>);

/// Split the input into records, keyed by 0-based line index. Blank lines
/// are not records and get no outcome; unparseable lines are kept so they
/// surface in the error log instead of being dropped.
pub fn parse_lines(raw: &str) -> Vec<ParsedLine> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let parsed = serde_json::from_str::<Value>(line)
                .map_err(|e| format!("invalid JSON: {e}"));
            (index, parsed)
        })
        .collect()
}

/// Run one batch end to end.
pub async fn run_batch(
    config: &BatchConfig,
    resolver: Arc<dyn FieldResolver>,
    service: Arc<dyn ComputeService>,
) -> Result<BatchSummary> {
    let input_schema = Arc::new(CompiledSchema::load("PayrollInput", &config.input_schema)?);
    let result_schema = Arc::new(CompiledSchema::load("PayrollResult", &config.result_schema)?);

    let raw = std::fs::read_to_string(&config.input).map_err(|e| {
        NominaError::config(format!("cannot read input {}: {e}", config.input.display()))
    })?;
    let entries = parse_lines(&raw);
    let total = entries.len();
    if total == 0 {
        warn!("input contains no records");
        return Ok(BatchSummary {
            total: 0,
            succeeded: 0,
            failed: 0,
        });
    }

    let writer = Arc::new(OutputWriter::new(&config.output_dir)?);
    let error_log = Arc::new(ErrorLog::create(&config.output_dir)?);

    info!(total, workers = config.workers, "dispatching batch");
    let progress = create_progress_bar(total);
    resolver.attach_progress(&progress);
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));

    let mut futures = Vec::new();
    for (line_index, parsed) in entries {
        let input_schema = input_schema.clone();
        let result_schema = result_schema.clone();
        let resolver = resolver.clone();
        let service = service.clone();
        let writer = writer.clone();
        let error_log = error_log.clone();
        let semaphore = semaphore.clone();
        let progress = progress.clone();

        let future = async move {
            let _permit = semaphore.acquire().await.unwrap();
            let outcome = match parsed {
                Ok(payload) => {
                    process_record(
                        line_index,
                        payload,
                        &input_schema,
                        &result_schema,
                        resolver.as_ref(),
                        service.as_ref(),
                        &writer,
                    )
                    .await
                }
                Err(reason) => Err(NominaError::schema("PayrollInput", reason)),
            };
            progress.inc(1);

            match outcome {
                Ok(path) => {
                    debug!(line_index, path = %path.display(), "record succeeded");
                    Ok(true)
                }
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    warn!(line_index, "record failed: {e}");
                    error_log.append(line_index, &e.to_string()).await?;
                    Ok(false)
                }
            }
        };
        futures.push(future);
    }

    let results = join_all(futures).await;

    let mut succeeded = 0;
    let mut failed = 0;
    for result in results {
        match result {
            Ok(true) => succeeded += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                progress.finish_and_clear();
                return Err(e);
            }
        }
    }

    progress.finish_with_message(format!("{succeeded} ok, {failed} errors"));
    info!(total, succeeded, failed, "batch complete");

    Ok(BatchSummary {
        total,
        succeeded,
        failed,
    })
}

/// The linear per-record pipeline. Every error returned here is
/// record-level and ends up in the error log.
async fn process_record(
    line_index: usize,
    payload: Value,
    input_schema: &CompiledSchema,
    result_schema: &CompiledSchema,
    resolver: &dyn FieldResolver,
    service: &dyn ComputeService,
    writer: &OutputWriter,
) -> Result<PathBuf> {
    input_schema.check(&payload)?;
    let enriched = enrich_region(&payload);
    let missing = detect_missing(&enriched);
    if !missing.is_empty() {
        debug!(
            line_index,
            count = missing.len(),
            "resolving missing fields"
        );
    }
    let (resolved, warnings) = resolver.resolve(enriched, missing).await?;
    let mut result = service.compute(&resolved).await?;
    merge_warnings(&mut result, &warnings);
    result_schema.check(&result)?;
    writer.write_result(line_index, &resolved, &result)
}

/// Carry preflight substitution warnings into the result's `warnings` array
/// so every defaulted value stays traceable in the persisted output.
fn merge_warnings(result: &mut Value, warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    if let Some(obj) = result.as_object_mut() {
        let entry = obj
            .entry("warnings")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = entry.as_array_mut() {
            list.extend(warnings.iter().map(|w| Value::String(w.clone())));
        }
    }
}

fn create_progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░ "),
    );
    pb
}
