//! Rule sources, the rule transform cache and rule evaluation

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use moka::sync::Cache;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::diagnostic::{Diagnostic, Severity};
use crate::document::LabelDocument;
use crate::error::{Result, ValidationError};
use crate::location;
use crate::markup::normalize_space;
use crate::resource_loader::ResourceLoader;
use crate::schematron::{
    CompiledRuleTransform, ISO_SCHEMATRON_NAMESPACE, RuleReport, SCHEMATRON_15_NAMESPACE,
};

/// Cached regex for the pseudo-attributes of an xml-model processing instruction
static PSEUDO_ATTRIBUTE_REGEX: OnceLock<Regex> = OnceLock::new();

fn pseudo_attribute_regex() -> &'static Regex {
    PSEUDO_ATTRIBUTE_REGEX.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("Failed to compile pseudo-attribute regex")
    })
}

/// A configured rule source
#[derive(Debug, Clone)]
pub enum RuleSource {
    /// URL or path of a schematron document, compiled through the cache
    Location(String),
    /// A transform compiled by the caller
    Compiled(Arc<CompiledRuleTransform>),
}

impl RuleSource {
    pub fn location(location: impl Into<String>) -> Self {
        RuleSource::Location(location.into())
    }

    pub fn describe(&self) -> &str {
        match self {
            RuleSource::Location(location) => location,
            RuleSource::Compiled(transform) => transform.source(),
        }
    }
}

impl From<&str> for RuleSource {
    fn from(location: &str) -> Self {
        RuleSource::Location(location.to_string())
    }
}

impl From<String> for RuleSource {
    fn from(location: String) -> Self {
        RuleSource::Location(location)
    }
}

impl From<Arc<CompiledRuleTransform>> for RuleSource {
    fn from(transform: Arc<CompiledRuleTransform>) -> Self {
        RuleSource::Compiled(transform)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleCacheStats {
    pub compilations: u64,
    pub hits: u64,
    pub seeded: usize,
}

/// Compiled transforms keyed by the absolute URL of their source
pub struct RuleTransformCache {
    compiled: Cache<String, Arc<CompiledRuleTransform>>,
    seeded: HashMap<String, Arc<CompiledRuleTransform>>,
    compilations: AtomicU64,
    hits: AtomicU64,
}

impl RuleTransformCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            compiled: Cache::builder().max_capacity(max_capacity).build(),
            seeded: HashMap::new(),
            compilations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Cache key for a rule source location
    pub fn key(location: &str) -> String {
        location::canonical(location)
    }

    /// Register a precompiled transform; seeded entries survive `invalidate`.
    pub fn seed(&mut self, location: &str, transform: Arc<CompiledRuleTransform>) {
        self.seeded.insert(Self::key(location), transform);
    }

    pub fn get_or_compile(
        &self,
        location: &str,
        loader: &ResourceLoader,
    ) -> Result<Arc<CompiledRuleTransform>> {
        let key = Self::key(location);
        if let Some(transform) = self
            .seeded
            .get(&key)
            .cloned()
            .or_else(|| self.compiled.get(&key))
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(source = %key, "rule transform cache hit");
            return Ok(transform);
        }

        self.compiled
            .try_get_with(key.clone(), || {
                let resource =
                    loader
                        .fetch(&key)
                        .map_err(|e| ValidationError::RuleCompilation {
                            url: key.clone(),
                            details: e.to_string(),
                        })?;
                let transform = CompiledRuleTransform::compile(&key, &resource.text())?;
                self.compilations.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ValidationError>(Arc::new(transform))
            })
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| ValidationError::RuleCompilation {
                    url: key,
                    details: shared.to_string(),
                })
            })
    }

    /// Drop compiled transforms; seeded ones stay.
    pub fn invalidate(&self) {
        self.compiled.invalidate_all();
    }

    pub fn stats(&self) -> RuleCacheStats {
        RuleCacheStats {
            compilations: self.compilations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            seeded: self.seeded.len(),
        }
    }
}

impl Default for RuleTransformCache {
    fn default() -> Self {
        Self::new(256)
    }
}

/// An `xml-model` processing instruction found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReference {
    pub href: String,
    pub schematypens: Option<String>,
    pub base_uri: Option<String>,
}

impl RuleReference {
    /// Parse the data of an `xml-model` processing instruction.
    pub fn parse(data: &str, base_uri: Option<String>) -> Option<Self> {
        let pattern = pseudo_attribute_regex();
        let data = normalize_space(data);
        let mut href = None;
        let mut schematypens = None;
        for captures in pattern.captures_iter(&data) {
            let value = captures
                .get(2)
                .or_else(|| captures.get(3))
                .map(|m| m.as_str().trim().to_string());
            match captures.get(1).map(|m| m.as_str()) {
                Some("href") => href = value,
                Some("schematypens") => schematypens = value,
                _ => {}
            }
        }
        Some(Self {
            href: href.filter(|h| !h.is_empty())?,
            schematypens,
            base_uri,
        })
    }

    /// Whether the reference names a schematron rule source. References
    /// without `schematypens` are taken as schematron.
    pub fn is_schematron(&self) -> bool {
        self.schematypens
            .as_deref()
            .is_none_or(|ns| ns == ISO_SCHEMATRON_NAMESPACE || ns == SCHEMATRON_15_NAMESPACE)
    }

    /// Absolute URL of the referenced source
    pub fn resolve(&self, document_locator: &str) -> std::result::Result<String, String> {
        if location::is_absolute_url(&self.href) {
            return Ok(self.href.clone());
        }
        let base = self.base_uri.as_deref().unwrap_or(document_locator);
        let base = location::to_url(base).ok_or_else(|| format!("invalid base URI '{}'", base))?;
        base.join(&self.href)
            .map(String::from)
            .map_err(|e| e.to_string())
    }
}

/// Turn the failed assertions of a report into diagnostics, in report order.
pub fn report_diagnostics(report: &RuleReport, locator: &str) -> Vec<Diagnostic> {
    report
        .failed_assertions()
        .map(|entry| {
            Diagnostic::new(
                Severity::from_role(entry.role.as_deref()),
                entry.message.trim(),
                locator,
            )
            .with_location(entry.location.clone())
            .with_failed_test(entry.test.clone())
        })
        .collect()
}

/// Resolves, compiles and runs rule transforms for one validation run
pub struct RuleEvaluator<'a> {
    cache: &'a RuleTransformCache,
    loader: &'a ResourceLoader,
}

impl<'a> RuleEvaluator<'a> {
    pub fn new(cache: &'a RuleTransformCache, loader: &'a ResourceLoader) -> Self {
        Self { cache, loader }
    }

    /// Schematron references declared by the document's `xml-model`
    /// processing instructions.
    pub fn discover(document: &LabelDocument) -> Result<Vec<RuleReference>> {
        Ok(document
            .processing_instructions()?
            .into_iter()
            .filter(|pi| pi.target.eq_ignore_ascii_case("xml-model"))
            .filter_map(|pi| RuleReference::parse(&pi.data, pi.base_uri))
            .filter(|reference| {
                let schematron = reference.is_schematron();
                if !schematron {
                    debug!(href = %reference.href, "skipping non-schematron xml-model");
                }
                schematron
            })
            .collect())
    }

    /// Transforms for the configured sources. Any failure aborts the run.
    pub fn configured(&self, sources: &[RuleSource]) -> Result<Vec<Arc<CompiledRuleTransform>>> {
        sources
            .iter()
            .map(|source| match source {
                RuleSource::Location(location) => self.cache.get_or_compile(location, self.loader),
                RuleSource::Compiled(transform) => Ok(transform.clone()),
            })
            .collect()
    }

    /// Transforms declared by the document. Unresolvable or broken sources
    /// become Error diagnostics and are skipped.
    pub fn declared(
        &self,
        document: &LabelDocument,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<Arc<CompiledRuleTransform>>> {
        let locator = document.locator();
        let mut transforms = Vec::new();
        for reference in Self::discover(document)? {
            let url = match reference.resolve(locator) {
                Ok(url) => url,
                Err(reason) => {
                    diagnostics.push(Diagnostic::error(
                        format!(
                            "Cannot resolve schematron specification '{}': {}",
                            reference.href, reason
                        ),
                        locator,
                    ));
                    continue;
                }
            };
            match self.cache.get_or_compile(&url, self.loader) {
                Ok(transform) => transforms.push(transform),
                Err(e) => {
                    warn!(%url, error = %e, "skipping rule source");
                    diagnostics.push(Diagnostic::error(
                        format!("Error occurred while loading rule source '{}': {}", url, e),
                        locator,
                    ));
                }
            }
        }
        Ok(transforms)
    }

    /// Run each transform in order and collect failed assertions.
    pub fn evaluate(
        &self,
        transforms: &[Arc<CompiledRuleTransform>],
        document: &LabelDocument,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let locator = document.locator();
        for transform in transforms {
            match transform.evaluate(document) {
                Ok(report) => {
                    debug!(
                        source = %report.source,
                        failed = report.failed_assertions().count(),
                        "rule report"
                    );
                    diagnostics.extend(report_diagnostics(&report, locator));
                }
                Err(e) => {
                    warn!(source = %transform.source(), error = %e, "rule evaluation failed");
                    diagnostics.push(Diagnostic::error(
                        format!(
                            "Error occurred while evaluating rule source '{}': {}",
                            transform.source(),
                            e
                        ),
                        locator,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogResolver;
    use crate::document::DocumentParser;
    use crate::schematron::{ReportEntry, ReportKind};
    use tempfile::TempDir;

    const RULES: &str = r#"<sch:schema xmlns:sch="http://purl.oclc.org/dsdl/schematron">
  <sch:ns prefix="pds" uri="urn:pds"/>
  <sch:pattern>
    <sch:rule context="pds:Product">
      <sch:assert test="pds:title">A product needs a title.</sch:assert>
    </sch:rule>
  </sch:pattern>
</sch:schema>"#;

    fn loader() -> ResourceLoader {
        ResourceLoader::uncached(Arc::new(CatalogResolver::empty()))
    }

    fn label(pi: &str) -> LabelDocument {
        let xml = format!("<?xml version=\"1.0\"?>\n{}\n<Product xmlns=\"urn:pds\"/>", pi);
        DocumentParser::default()
            .parse(xml.as_bytes(), "file:///labels/label.xml", None)
            .unwrap()
            .0
    }

    fn entry(role: Option<&str>) -> ReportEntry {
        ReportEntry {
            kind: ReportKind::FailedAssertion,
            message: "  needs a title \n".to_string(),
            role: role.map(str::to_string),
            location: "/*".to_string(),
            test: "pds:title".to_string(),
            id: None,
            flag: None,
        }
    }

    #[test]
    fn test_reference_parsing() {
        let reference = RuleReference::parse(
            "href=\"PDS4_PDS_1B00.sch\"\n   schematypens=\"http://purl.oclc.org/dsdl/schematron\"",
            None,
        )
        .unwrap();
        assert_eq!(reference.href, "PDS4_PDS_1B00.sch");
        assert!(reference.is_schematron());

        let xsd = RuleReference::parse(
            "href='a.xsd' schematypens='http://www.w3.org/2001/XMLSchema'",
            None,
        )
        .unwrap();
        assert!(!xsd.is_schematron());

        assert!(RuleReference::parse("type=\"text/xsl\"", None).is_none());
    }

    #[test]
    fn test_pseudo_attribute_regex_is_shared() {
        let regex = pseudo_attribute_regex();
        assert!(std::ptr::eq(regex, pseudo_attribute_regex()));

        let names: Vec<_> = regex
            .captures_iter(r#"href = 'a.sch' schematypens="urn:x""#)
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(names, vec!["href", "schematypens"]);
    }

    #[test]
    fn test_reference_resolution() {
        let relative = RuleReference {
            href: "rules/a.sch".to_string(),
            schematypens: None,
            base_uri: Some("file:///data/labels/label.xml".to_string()),
        };
        assert_eq!(relative.resolve("ignored").unwrap(), "file:///data/labels/rules/a.sch");

        let absolute = RuleReference {
            href: "https://pds.nasa.gov/a.sch".to_string(),
            schematypens: None,
            base_uri: None,
        };
        assert_eq!(absolute.resolve("file:///x.xml").unwrap(), "https://pds.nasa.gov/a.sch");

        let broken = RuleReference {
            href: "http://[::1".to_string(),
            schematypens: None,
            base_uri: Some("file:///x.xml".to_string()),
        };
        assert!(broken.resolve("file:///x.xml").is_err());
    }

    #[test]
    fn test_severity_mapping_from_roles() {
        for (role, expected) in [
            (Some("warn"), Severity::Warning),
            (Some("WARNING"), Severity::Warning),
            (Some("Info"), Severity::Info),
            (Some("fatal"), Severity::Error),
            (None, Severity::Error),
        ] {
            let report = RuleReport {
                source: "r.sch".to_string(),
                entries: vec![entry(role)],
            };
            let diagnostics = report_diagnostics(&report, "label.xml");
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].severity(), expected);
            assert_eq!(diagnostics[0].message(), "needs a title");
            assert_eq!(diagnostics[0].failed_test(), Some("pds:title"));
            assert_eq!(diagnostics[0].location(), Some("/*"));
        }
    }

    #[test]
    fn test_cache_compiles_once_and_keeps_seeds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.sch");
        std::fs::write(&path, RULES).unwrap();
        let location = path.to_string_lossy().into_owned();
        let loader = loader();

        let mut cache = RuleTransformCache::default();
        let first = cache.get_or_compile(&location, &loader).unwrap();
        let second = cache.get_or_compile(&location::canonical(&location), &loader).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().compilations, 1);
        assert_eq!(cache.stats().hits, 1);

        let seeded = Arc::new(CompiledRuleTransform::compile("urn:seeded", RULES).unwrap());
        cache.seed("http://example.com/seeded.sch", seeded.clone());
        cache.invalidate();

        let again = cache.get_or_compile("http://example.com/seeded.sch", &loader).unwrap();
        assert!(Arc::ptr_eq(&again, &seeded));
        cache.get_or_compile(&location, &loader).unwrap();
        assert_eq!(cache.stats().compilations, 2);
        assert_eq!(cache.stats().seeded, 1);
    }

    #[test]
    fn test_failed_compilation_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late.sch");
        let location = path.to_string_lossy().into_owned();
        let loader = loader();
        let cache = RuleTransformCache::default();

        assert!(matches!(
            cache.get_or_compile(&location, &loader),
            Err(ValidationError::RuleCompilation { .. })
        ));
        std::fs::write(&path, RULES).unwrap();
        assert!(cache.get_or_compile(&location, &loader).is_ok());
    }

    #[test]
    fn test_declared_sources_with_failures() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("rules.sch"), RULES).unwrap();
        let base = location::canonical(&dir.path().join("label.xml").to_string_lossy());
        let xml = r#"<?xml version="1.0"?>
<?xml-model href="rules.sch" schematypens="http://purl.oclc.org/dsdl/schematron"?>
<?XML-MODEL href="missing.sch"?>
<?xml-model href="product.xsd" schematypens="http://www.w3.org/2001/XMLSchema"?>
<?xml-model href="http://[::1" schematypens="http://purl.oclc.org/dsdl/schematron"?>
<Product xmlns="urn:pds"/>"#;
        let (document, _) = DocumentParser::default()
            .parse(xml.as_bytes(), &base, None)
            .unwrap();

        let loader = loader();
        let cache = RuleTransformCache::default();
        let evaluator = RuleEvaluator::new(&cache, &loader);
        let mut diagnostics = Vec::new();
        let transforms = evaluator.declared(&document, &mut diagnostics).unwrap();

        assert_eq!(transforms.len(), 1);
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].message().starts_with("Error occurred while loading rule source"));
        assert!(diagnostics[1].message().starts_with("Cannot resolve schematron specification 'http://[::1'"));
        assert!(diagnostics.iter().all(|d| d.severity() == Severity::Error));

        let mut findings = Vec::new();
        evaluator.evaluate(&transforms, &document, &mut findings);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].message(), "A product needs a title.");
        assert_eq!(findings[0].source(), base);
    }

    #[test]
    fn test_configured_sources_fail_hard() {
        let loader = loader();
        let cache = RuleTransformCache::default();
        let evaluator = RuleEvaluator::new(&cache, &loader);
        let compiled = Arc::new(CompiledRuleTransform::compile("urn:inline", RULES).unwrap());

        let ok = evaluator.configured(&[RuleSource::from(compiled.clone())]).unwrap();
        assert!(Arc::ptr_eq(&ok[0], &compiled));

        let result = evaluator.configured(&[
            RuleSource::from(compiled),
            RuleSource::location("/no/such/rules.sch"),
        ]);
        assert!(matches!(result, Err(ValidationError::RuleCompilation { .. })));
    }

    #[test]
    fn test_discover_ignores_other_instructions() {
        let document = label("<?xml-stylesheet href=\"style.xsl\"?>");
        assert!(RuleEvaluator::discover(&document).unwrap().is_empty());
    }
}
