//! Terminal prompting
//!
//! The prompter sits behind a trait so tests can script answers instead of
//! driving a real terminal.

use crate::error::{NominaError, Result};
use std::io::{self, IsTerminal, Write};

/// Trait for asking a human for a field value. Prompting is blocking
/// terminal IO, so the trait is synchronous; callers that render a progress
/// bar wrap the call in `ProgressBar::suspend`.
pub trait UserPrompter: Send + Sync {
    /// Prompt for text input; an empty answer means "use the default".
    fn prompt_text(&self, message: &str) -> Result<String>;
}

/// Real prompter reading from stdin.
pub struct TerminalPrompter;

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }

    /// The `ask` policy needs a terminal; refusing up front beats hanging a
    /// headless batch run on a read that will never complete.
    pub fn require_terminal() -> Result<()> {
        if io::stdin().is_terminal() {
            Ok(())
        } else {
            Err(NominaError::config(
                "missing-field policy 'ask' requires an interactive terminal; \
                 use --missing-policy default or fail in non-interactive runs",
            ))
        }
    }

    fn read_line() -> Result<String> {
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }
}

impl UserPrompter for TerminalPrompter {
    fn prompt_text(&self, message: &str) -> Result<String> {
        print!("{message}\n> ");
        io::stdout().flush()?;
        Self::read_line()
    }
}
