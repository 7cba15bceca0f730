//! Structured-output inference client
//!
//! The payroll computation itself is delegated to an external model behind
//! the Responses API; this module only builds the request, walks the reply
//! for the structured message, and retries transient failures with
//! exponential backoff.

use crate::config::BatchConfig;
use crate::error::{NominaError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Developer prompt handed to the model alongside every record.
pub const PAYROLL_PROMPT: &str = "\
Eres un motor experto en cálculo de nóminas en España (año en curso).
Objetivo: devolver una nómina correcta y trazable a partir de un JSON de entrada que cumple el \"PayrollInputSchema\".

Instrucciones de cálculo y validación:
1) Jurisdicción y tablas: determina la jurisdicción IRPF con input.region_config.irpf_regime
   (AEAT estatal, FORAL_NAVARRA, o FORAL_PV según worker.address.province). Seguridad Social siempre estatal.
2) Convenio y estructura retributiva: usa input.collective_agreement.*; si el salario < SMI para la jornada, eleva a SMI.
3) Devengos: salario base + complementos + prorrata de extras (si aplica) + horas extra.
4) Bases de cotización: aplica topes mín./máx., prorrata extras, MEI y solidaridad si procede.
5) Cuotas SS (trabajador y empresa): CC, AT/EP, desempleo, FOGASA, formación, MEI, solidaridad.
6) IRPF: usa worker.form145 (o foral) y calcula la retención según jurisdicción.
7) Incidencias: IT/MA/PA/ERTE según LGSS/orden anual.
8) Neto y validaciones: neto = devengos - (SS trabajador + IRPF + otros descuentos); valida SMI, topes base, CRA y calendario.
9) Salida: devuelve JSON \"PayrollResult\" con desglose completo, CRA por concepto, trace y advertencias.

Responde SOLO con JSON válido que cumpla \"PayrollResultSchema\". No incluyas texto adicional.";

/// The one call this pipeline needs from the outside world: a structured
/// request in, a structured response or an error out.
#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn compute(&self, record: &Value) -> Result<Value>;
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct SchemaFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    schema: &'a Value,
    strict: bool,
}

#[derive(Debug, Serialize)]
struct TextConfig<'a> {
    format: SchemaFormat<'a>,
    verbosity: &'a str,
}

#[derive(Debug, Serialize)]
struct Reasoning<'a> {
    effort: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<Message<'a>>,
    text: TextConfig<'a>,
    reasoning: Reasoning<'a>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Responses-API client with retry logic.
pub struct InferenceClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    result_schema: Value,
    temperature: f32,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl InferenceClient {
    pub fn new(config: &BatchConfig, result_schema: Value) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NominaError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            result_schema,
            temperature: config.temperature(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    async fn make_request(&self, record: &Value) -> Result<Value> {
        let request = ResponsesRequest {
            model: &self.model,
            input: vec![
                Message {
                    role: "developer",
                    content: PAYROLL_PROMPT.to_string(),
                },
                Message {
                    role: "user",
                    content: serde_json::to_string(record)?,
                },
            ],
            text: TextConfig {
                format: SchemaFormat {
                    kind: "json_schema",
                    name: "PayrollResult",
                    schema: &self.result_schema,
                    strict: true,
                },
                verbosity: "low",
            },
            reasoning: Reasoning { effort: "medium" },
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NominaError::service("request timed out")
                } else if e.is_connect() {
                    NominaError::service(format!("connection failed: {e}"))
                } else {
                    NominaError::service(format!("request failed: {e}"))
                }
            })?;

        match response.status() {
            StatusCode::OK => {
                let reply: ResponsesReply = response
                    .json()
                    .await
                    .map_err(|e| NominaError::service(format!("failed to parse response: {e}")))?;
                extract_structured_output(&reply)
            }
            StatusCode::TOO_MANY_REQUESTS => Err(NominaError::service("rate limit exceeded")),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(NominaError::service(format!("API error {status}: {detail}")))
            }
        }
    }

}

/// Transient failures worth retrying: rate limiting, timeouts, connection
/// drops. Anything else fails the record immediately.
fn is_transient(error: &NominaError) -> bool {
    match error {
        NominaError::Service(msg) => {
            msg.contains("rate limit") || msg.contains("timed out") || msg.contains("connection")
        }
        _ => false,
    }
}

fn backoff_delay_ms(base_ms: u64, retry_count: u32) -> u64 {
    base_ms * 2u64.pow(retry_count - 1)
}

/// Drive `attempt` until it succeeds, a non-transient error occurs, or the
/// retry budget runs out. The delay doubles per retry.
async fn retry_transient<T, F, Fut>(max_retries: u32, base_delay_ms: u64, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut retry_count = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if retry_count >= max_retries || !is_transient(&e) {
                    return Err(e);
                }
                retry_count += 1;
                let delay = backoff_delay_ms(base_delay_ms, retry_count);
                warn!(retry = retry_count, delay_ms = delay, "retrying after {e}");
                sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

#[async_trait]
impl ComputeService for InferenceClient {
    async fn compute(&self, record: &Value) -> Result<Value> {
        retry_transient(self.max_retries, self.retry_delay_ms, || {
            self.make_request(record)
        })
        .await
    }
}

/// Pull the structured JSON payload out of a Responses reply: the first
/// `output_text` content of the first `message` item.
fn extract_structured_output(reply: &ResponsesReply) -> Result<Value> {
    for item in &reply.output {
        if item.kind != "message" {
            continue;
        }
        for content in &item.content {
            if content.kind == "output_text" {
                debug!(bytes = content.text.len(), "parsing structured output");
                return serde_json::from_str(&content.text).map_err(|e| {
                    NominaError::service(format!("model returned invalid JSON: {e}"))
                });
            }
        }
    }
    Err(NominaError::service(
        "no structured output in model response",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reply_from(value: Value) -> ResponsesReply {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn extracts_output_text_from_message_item() {
        let reply = reply_from(json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "refusal", "text": ""},
                    {"type": "output_text", "text": "{\"net\": 1500.0}"}
                ]}
            ]
        }));
        let result = extract_structured_output(&reply).unwrap();
        assert_eq!(result["net"], 1500.0);
    }

    #[test]
    fn missing_message_is_a_service_error() {
        let reply = reply_from(json!({"output": [{"type": "reasoning"}]}));
        let err = extract_structured_output(&reply).unwrap_err();
        assert!(matches!(err, NominaError::Service(_)));
    }

    #[test]
    fn malformed_payload_is_a_service_error() {
        let reply = reply_from(json!({
            "output": [{"type": "message", "content": [
                {"type": "output_text", "text": "not json"}
            ]}]
        }));
        assert!(extract_structured_output(&reply).is_err());
    }

    #[test]
    fn retryable_errors_are_transient_only() {
        assert!(is_transient(&NominaError::service("rate limit exceeded")));
        assert!(is_transient(&NominaError::service("request timed out")));
        assert!(!is_transient(&NominaError::service(
            "API error 400 Bad Request: bad schema"
        )));
        assert!(!is_transient(&NominaError::MissingField("worker.nif".into())));
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(backoff_delay_ms(100, 1), 100);
        assert_eq!(backoff_delay_ms(100, 2), 200);
        assert_eq!(backoff_delay_ms(100, 3), 400);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(3, 1, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(NominaError::service("rate limit exceeded"))
                } else {
                    Ok(json!({"net": 1500.0}))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result["net"], 1500.0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry_transient::<Value, _, _>(2, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(NominaError::service("request timed out")) }
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        // One initial attempt plus the full retry budget.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_on_the_first_attempt() {
        let calls = AtomicU32::new(0);
        let err = retry_transient::<Value, _, _>(5, 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(NominaError::service("API error 400 Bad Request: bad schema")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, NominaError::Service(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
