//! Missing-field resolution policies
//!
//! The dispatcher receives a [`FieldResolver`] rather than a policy flag so
//! tests can inject a scripted resolver. Interactive resolution is
//! serialized across workers through a single prompt lock.

use crate::error::{NominaError, Result};
use crate::interaction::{TerminalPrompter, UserPrompter};
use crate::preflight::{apply_value, parse_answer, MissingField};
use async_trait::async_trait;
use clap::ValueEnum;
use indicatif::ProgressBar;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// How a batch run handles fields the record does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MissingFieldPolicy {
    /// Prompt on the terminal for each missing value.
    Ask,
    /// Substitute each field's configured fallback value.
    Default,
    /// Reject the record immediately.
    Fail,
}

/// Resolves a record's missing fields according to the active policy.
/// Returns the completed record plus one warning per substituted value; the
/// warnings are appended to the computation result for traceability.
#[async_trait]
pub trait FieldResolver: Send + Sync {
    async fn resolve(
        &self,
        record: Value,
        missing: Vec<MissingField>,
    ) -> Result<(Value, Vec<String>)>;

    /// Called once per run with the dispatcher's progress bar. Interactive
    /// resolvers suspend it while a prompt is open so redraws cannot garble
    /// the question; the non-interactive resolvers ignore it.
    fn attach_progress(&self, _progress: &ProgressBar) {}
}

/// `fail` policy: any missing field rejects the record before it reaches the
/// service.
pub struct FailFastResolver;

#[async_trait]
impl FieldResolver for FailFastResolver {
    async fn resolve(
        &self,
        record: Value,
        missing: Vec<MissingField>,
    ) -> Result<(Value, Vec<String>)> {
        if missing.is_empty() {
            return Ok((record, Vec::new()));
        }
        let paths: Vec<String> = missing.into_iter().map(|m| m.path).collect();
        Err(NominaError::MissingField(paths.join("; ")))
    }
}

/// `default` policy: fill from the per-field fallback table; a field with no
/// fallback still rejects the record.
pub struct DefaultResolver;

#[async_trait]
impl FieldResolver for DefaultResolver {
    async fn resolve(
        &self,
        mut record: Value,
        missing: Vec<MissingField>,
    ) -> Result<(Value, Vec<String>)> {
        let mut warnings = Vec::new();
        for field in missing {
            let default = field
                .default
                .clone()
                .ok_or_else(|| NominaError::MissingField(field.path.clone()))?;
            debug!(path = %field.path, value = %default, "applying default");
            warnings.push(format!("Valor por defecto aplicado en {}: {default}", field.path));
            apply_value(&mut record, &field, default);
        }
        Ok((record, warnings))
    }
}

/// `ask` policy: prompt for each missing value. Prompts are serialized
/// across workers so concurrent records cannot interleave on the terminal.
pub struct InteractiveResolver {
    prompter: Arc<dyn UserPrompter>,
    prompt_lock: Mutex<()>,
    progress: std::sync::Mutex<Option<ProgressBar>>,
}

impl InteractiveResolver {
    pub fn new(prompter: Arc<dyn UserPrompter>) -> Self {
        Self {
            prompter,
            prompt_lock: Mutex::new(()),
            progress: std::sync::Mutex::new(None),
        }
    }

    fn ask(&self, question: &str) -> Result<String> {
        let bar = self.progress.lock().unwrap().clone();
        match bar {
            Some(bar) => bar.suspend(|| self.prompter.prompt_text(question)),
            None => self.prompter.prompt_text(question),
        }
    }

    /// Build against the real terminal; fails when stdin is not interactive.
    pub fn from_terminal() -> Result<Self> {
        TerminalPrompter::require_terminal()?;
        Ok(Self::new(Arc::new(TerminalPrompter::new())))
    }

    fn question_for(field: &MissingField) -> String {
        let mut question = format!("{} [{}]", field.question, field.hint);
        if !field.choices.is_empty() {
            question.push_str(&format!(" Opciones: {}", field.choices.join(", ")));
        }
        question
    }
}

#[async_trait]
impl FieldResolver for InteractiveResolver {
    async fn resolve(
        &self,
        mut record: Value,
        missing: Vec<MissingField>,
    ) -> Result<(Value, Vec<String>)> {
        if missing.is_empty() {
            return Ok((record, Vec::new()));
        }
        let _guard = self.prompt_lock.lock().await;
        let mut warnings = Vec::new();
        for field in missing {
            let answer = self.ask(&Self::question_for(&field))?;
            let value = if answer.is_empty() {
                match field.default.clone() {
                    Some(default) => {
                        warnings.push(format!(
                            "Usado valor por defecto en {}: {default}",
                            field.path
                        ));
                        default
                    }
                    None => return Err(NominaError::MissingField(field.path.clone())),
                }
            } else {
                parse_answer(&answer, &field)?
            };
            apply_value(&mut record, &field, value);
        }
        Ok((record, warnings))
    }

    fn attach_progress(&self, progress: &ProgressBar) {
        *self.progress.lock().unwrap() = Some(progress.clone());
    }
}

/// Resolver for the selected policy. The terminal check happens here, before
/// any record is dispatched.
pub fn resolver_for(policy: MissingFieldPolicy) -> Result<Arc<dyn FieldResolver>> {
    match policy {
        MissingFieldPolicy::Ask => Ok(Arc::new(InteractiveResolver::from_terminal()?)),
        MissingFieldPolicy::Default => Ok(Arc::new(DefaultResolver)),
        MissingFieldPolicy::Fail => Ok(Arc::new(FailFastResolver)),
    }
}
