//! End-to-end batch runs against a scripted computation service.

use async_trait::async_trait;
use nomina::config::BatchConfig;
use nomina::dispatch::run_batch;
use nomina::error::{NominaError, Result};
use nomina::output::ErrorRecord;
use nomina::resolve::{DefaultResolver, FailFastResolver, FieldResolver, MissingFieldPolicy};
use nomina::service::ComputeService;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Scripted stand-in for the inference service. Deterministic: the result
/// echoes the worker NIF so outputs are distinguishable per record.
struct ScriptedService {
    calls: AtomicUsize,
    fail_with: Option<String>,
    result_template: Value,
}

impl ScriptedService {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: None,
            result_template: json!({"net": 1500.0}),
        }
    }

    fn failing(reason: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(reason.to_string()),
            result_template: json!({}),
        }
    }

    fn with_result(result: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: None,
            result_template: result,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeService for ScriptedService {
    async fn compute(&self, record: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(NominaError::service(reason.clone()));
        }
        let mut result = self.result_template.clone();
        if let Some(nif) = record.get("worker").and_then(|w| w.get("nif")) {
            result["worker_nif"] = nif.clone();
        }
        Ok(result)
    }
}

fn write_schemas(dir: &Path) {
    let input_schema = json!({
        "type": "object",
        "required": ["period", "worker", "region_config", "compensation"],
        "properties": {
            "period": {
                "type": "object",
                "required": ["year", "month"],
                "properties": {
                    "year": {"type": "number"},
                    "month": {"type": "number"}
                }
            },
            "worker": {"type": "object"},
            "region_config": {"type": "object"},
            "compensation": {"type": "object"}
        }
    });
    let result_schema = json!({
        "type": "object",
        "required": ["net"],
        "properties": {
            "net": {"type": "number"},
            "worker_nif": {"type": "string"},
            "warnings": {"type": "array", "items": {"type": "string"}}
        }
    });
    std::fs::write(
        dir.join("payroll_input.schema.json"),
        serde_json::to_string_pretty(&input_schema).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("payroll_result.schema.json"),
        serde_json::to_string_pretty(&result_schema).unwrap(),
    )
    .unwrap();
}

fn config_for(dir: &Path, policy: MissingFieldPolicy, workers: usize) -> BatchConfig {
    BatchConfig {
        input: dir.join("input.jsonl"),
        output_dir: dir.join("outputs"),
        input_schema: dir.join("payroll_input.schema.json"),
        result_schema: dir.join("payroll_result.schema.json"),
        model: "gpt-5".into(),
        base_url: "http://localhost:1".into(),
        api_key: "test-key".into(),
        workers,
        timeout: Duration::from_secs(5),
        max_retries: 0,
        retry_delay_ms: 1,
        policy,
        deterministic: true,
    }
}

fn write_input(dir: &Path, lines: &[String]) {
    std::fs::write(dir.join("input.jsonl"), lines.join("\n")).unwrap();
}

/// A record with every defaultable field present, so the `fail` policy
/// lets it through.
fn complete_record(ccaa: &str, month: u64, nif: &str) -> Value {
    json!({
        "period": {"year": 2025, "month": month},
        "worker": {"nif": nif},
        "company": {"cnae": "6201"},
        "region_config": {"ccaa": ccaa, "irpf_regime": "AEAT"},
        "collective_agreement": {"allowances": []},
        "compensation": {"base_salary_cra_code": "C01", "variables": []},
        "tables": {"cotization_year": 2025, "irpf_year": 2025}
    })
}

fn read_error_log(dir: &Path) -> Vec<ErrorRecord> {
    let content = std::fs::read_to_string(dir.join("outputs").join("errors.ndjson")).unwrap();
    content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn output_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join("outputs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n != "errors.ndjson")
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn two_valid_lines_produce_index_keyed_outputs() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[
            complete_record("Galicia", 1, "11111111A").to_string(),
            complete_record("Cataluña", 2, "22222222B").to_string(),
        ],
    );

    let service = Arc::new(ScriptedService::ok());
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 2);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service.clone())
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(service.call_count(), 2);
    assert_eq!(
        output_files(dir.path()),
        vec!["0_Galicia_01-2025.json", "1_Cataluña_02-2025.json"]
    );
    assert!(read_error_log(dir.path()).is_empty());

    // Each persisted result passed output validation and carries its own
    // record's data.
    let first: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("outputs/0_Galicia_01-2025.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(first["worker_nif"], "11111111A");
}

#[tokio::test]
async fn missing_compensation_under_fail_policy_never_calls_the_service() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[json!({
            "period": {"year": 2025, "month": 1},
            "worker": {"nif": "123"},
            "region_config": {"ccaa": "Galicia"}
        })
        .to_string()],
    );

    let service = Arc::new(ScriptedService::ok());
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 1);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service.clone())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(service.call_count(), 0);

    let errors = read_error_log(dir.path());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_index, 0);
    assert!(errors[0].reason.contains("compensation"));
    assert!(output_files(dir.path()).is_empty());
}

#[tokio::test]
async fn incomplete_record_under_fail_policy_is_rejected_before_dispatch() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    // Schema-valid, but the NIF and table years are absent.
    write_input(
        dir.path(),
        &[json!({
            "period": {"year": 2025, "month": 1},
            "worker": {},
            "region_config": {"ccaa": "Galicia"},
            "compensation": {}
        })
        .to_string()],
    );

    let service = Arc::new(ScriptedService::ok());
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 1);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service.clone())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(service.call_count(), 0);
    let errors = read_error_log(dir.path());
    assert!(errors[0].reason.starts_with("missing required field: "));
    assert!(errors[0].reason.contains("worker.nif"));
}

#[tokio::test]
async fn default_policy_completes_without_blocking_and_keeps_warnings() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[json!({
            "period": {"year": 2025, "month": 6},
            "worker": {},
            "region_config": {"ccaa": "Comunidad de Madrid"},
            "compensation": {}
        })
        .to_string()],
    );

    let service = Arc::new(ScriptedService::ok());
    let config = config_for(dir.path(), MissingFieldPolicy::Default, 1);
    let summary = run_batch(&config, Arc::new(DefaultResolver), service.clone())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    let files = output_files(dir.path());
    assert_eq!(files, vec!["0_ComunidaddeMadrid_06-2025.json"]);

    let result: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("outputs").join(&files[0])).unwrap(),
    )
    .unwrap();
    let warnings = result["warnings"].as_array().unwrap();
    assert!(warnings
        .iter()
        .any(|w| w.as_str().unwrap().contains("worker.nif")));
    assert!(warnings
        .iter()
        .any(|w| w.as_str().unwrap().contains("tables.cotization_year")));
}

#[tokio::test]
async fn service_failure_is_recorded_not_fatal() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[complete_record("Aragón", 3, "33333333C").to_string()],
    );

    let service = Arc::new(ScriptedService::failing("rate limit exceeded"));
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 1);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let errors = read_error_log(dir.path());
    assert_eq!(errors[0].line_index, 0);
    assert!(errors[0].reason.contains("service call failed"));
    assert!(output_files(dir.path()).is_empty());
}

#[tokio::test]
async fn nonconforming_response_is_an_error_not_a_success_file() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[complete_record("Canarias", 4, "44444444D").to_string()],
    );

    // "net" must be a number per the result schema.
    let service = Arc::new(ScriptedService::with_result(json!({"net": "a lot"})));
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 1);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let errors = read_error_log(dir.path());
    assert!(errors[0].reason.contains("PayrollResult"));
    assert!(output_files(dir.path()).is_empty());
}

#[tokio::test]
async fn every_line_gets_exactly_one_outcome() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[
            complete_record("Galicia", 1, "11111111A").to_string(),
            "this is not json".to_string(),
            String::new(), // blank: not a record
            complete_record("Cantabria", 2, "22222222B").to_string(),
        ],
    );

    let service = Arc::new(ScriptedService::ok());
    let config = config_for(dir.path(), MissingFieldPolicy::Fail, 2);
    let summary = run_batch(&config, Arc::new(FailFastResolver), service)
        .await
        .unwrap();

    // Blank line excluded; the other three each get one outcome.
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let errors = read_error_log(dir.path());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line_index, 1);
    assert!(errors[0].reason.contains("invalid JSON"));

    let files = output_files(dir.path());
    assert_eq!(files.len(), 2);
    assert!(files[0].starts_with("0_"));
    assert!(files[1].starts_with("3_"));
}

#[tokio::test]
async fn reruns_with_default_policy_are_idempotent() {
    let dir = TempDir::new().unwrap();
    write_schemas(dir.path());
    write_input(
        dir.path(),
        &[json!({
            "period": {"year": 2025, "month": 9},
            "worker": {},
            "region_config": {"ccaa": "La Rioja"},
            "compensation": {}
        })
        .to_string()],
    );
    let config = config_for(dir.path(), MissingFieldPolicy::Default, 1);

    let resolver: Arc<dyn FieldResolver> = Arc::new(DefaultResolver);
    run_batch(&config, resolver.clone(), Arc::new(ScriptedService::ok()))
        .await
        .unwrap();
    let first_files = output_files(dir.path());
    let first_content =
        std::fs::read_to_string(dir.path().join("outputs").join(&first_files[0])).unwrap();

    run_batch(&config, resolver, Arc::new(ScriptedService::ok()))
        .await
        .unwrap();
    let second_files = output_files(dir.path());
    let second_content =
        std::fs::read_to_string(dir.path().join("outputs").join(&second_files[0])).unwrap();

    assert_eq!(first_files, second_files);
    assert_eq!(first_content, second_content);
}
