//! Extension validators run after structural and rule validation
//!
//! Two ordered lists: validators that only need the document's locator (for
//! instance checks against an external registry) and validators that inspect
//! the parsed [`LabelDocument`]. Both run in registration order and may append
//! any number of diagnostics. Returning an error aborts the run.

use tracing::debug;

use crate::diagnostic::Diagnostic;
use crate::document::LabelDocument;
use crate::error::{Result, ValidationError};

/// Validator that receives the resolved reference of the document
pub trait ExternalValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, locator: &str, diagnostics: &mut Vec<Diagnostic>) -> anyhow::Result<()>;
}

/// Validator that receives the parsed document tree
pub trait DocumentValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(
        &self,
        document: &LabelDocument,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct HookSet {
    external: Vec<Box<dyn ExternalValidator>>,
    document: Vec<Box<dyn DocumentValidator>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_external(&mut self, validator: Box<dyn ExternalValidator>) {
        self.external.push(validator);
    }

    pub fn add_document(&mut self, validator: Box<dyn DocumentValidator>) {
        self.document.push(validator);
    }

    pub fn len(&self) -> usize {
        self.external.len() + self.document.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of all registered validators, reference validators first
    pub fn names(&self) -> Vec<&str> {
        self.external
            .iter()
            .map(|v| v.name())
            .chain(self.document.iter().map(|v| v.name()))
            .collect()
    }

    /// Run every reference validator, then every document validator.
    pub fn run(
        &self,
        document: &LabelDocument,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        for validator in &self.external {
            debug!(hook = validator.name(), "running reference validator");
            validator
                .validate(document.locator(), diagnostics)
                .map_err(|source| ValidationError::Extension {
                    name: validator.name().to_string(),
                    source,
                })?;
        }
        for validator in &self.document {
            debug!(hook = validator.name(), "running document validator");
            validator
                .validate(document, diagnostics)
                .map_err(|source| ValidationError::Extension {
                    name: validator.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.names())
            .finish()
    }
}
