//! Diagnostic model
//!
//! Every stage of a validation run reports problems as [`Diagnostic`] values.
//! A run appends them to a caller-owned [`Diagnostics`] aggregator in the order
//! they were produced.

use std::fmt;

use serde::Serialize;

/// Severity of a single diagnostic
///
/// Ordered so that `Severity::Error > Severity::Warning > Severity::Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Classify a rule report `role` attribute.
    ///
    /// `warn` and `warning` map to [`Severity::Warning`], `info` maps to
    /// [`Severity::Info`]; anything else, including an absent role, is an error.
    pub fn from_role(role: Option<&str>) -> Self {
        match role {
            Some(r) if r.eq_ignore_ascii_case("warn") || r.eq_ignore_ascii_case("warning") => {
                Severity::Warning
            }
            Some(r) if r.eq_ignore_ascii_case("info") => Severity::Info,
            _ => Severity::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding produced while validating one document
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    severity: Severity,
    message: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_test: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            source: source.into(),
            location: None,
            failed_test: None,
        }
    }

    pub fn error(message: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(Severity::Error, message, source)
    }

    pub fn warning(message: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message, source)
    }

    pub fn info(message: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(Severity::Info, message, source)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_failed_test(mut self, test: impl Into<String>) -> Self {
        self.failed_test = Some(test.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// URL or path of the document the diagnostic is about
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Line/column or node path inside the document
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Rule expression that failed, for rule diagnostics
    pub fn failed_test(&self) -> Option<&str> {
        self.failed_test.as_deref()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.source)?;
        if let Some(location) = &self.location {
            write!(f, " [{}]", location)?;
        }
        write!(f, " - {}", self.message)?;
        if let Some(test) = &self.failed_test {
            write!(f, " (test: {})", test)?;
        }
        Ok(())
    }
}

/// Ordered, append-only collection of diagnostics for one validation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    /// Diagnostics at or above the given severity, in order
    pub fn at_least(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.severity >= severity)
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.entries
    }
}

impl Extend<Diagnostic> for Diagnostics {
    fn extend<T: IntoIterator<Item = Diagnostic>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
