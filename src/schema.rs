//! JSON Schema loading and validation
//!
//! Schemas are authored externally; this module only compiles them once per
//! run and reports violations. Validation never mutates the instance.

use crate::error::{NominaError, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::path::Path;

/// One schema violation: a JSON-pointer into the instance plus the
/// validator's message.
#[derive(Debug, Clone)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Read a schema file as raw JSON. Needed both for compilation and for the
/// structured-output request, which ships the result schema to the service.
pub fn load_value(name: &str, path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        NominaError::config(format!(
            "cannot read schema {name} at {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| NominaError::config(format!("schema {name} is not valid JSON: {e}")))
}

/// A compiled schema with the name used in error reports.
#[derive(Debug)]
pub struct CompiledSchema {
    name: String,
    compiled: JSONSchema,
}

impl CompiledSchema {
    /// Compile a schema value. Compilation failure is a configuration
    /// problem, not a record problem.
    pub fn new(name: impl Into<String>, schema: &Value) -> Result<Self> {
        let name = name.into();
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(schema)
            .map_err(|e| NominaError::config(format!("cannot compile schema {name}: {e}")))?;
        Ok(Self { name, compiled })
    }

    /// Load and compile a schema file.
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self> {
        let name = name.into();
        let schema = load_value(&name, path)?;
        Self::new(name, &schema)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All violations for an instance; an empty list means valid.
    pub fn violations(&self, instance: &Value) -> Vec<Violation> {
        match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| Violation {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        }
    }

    /// Validate an instance, folding violations into one record-level error.
    pub fn check(&self, instance: &Value) -> Result<()> {
        let violations = self.violations(instance);
        if violations.is_empty() {
            return Ok(());
        }
        let detail = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(NominaError::schema(&self.name, detail))
    }
}
