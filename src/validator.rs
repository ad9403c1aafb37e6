//! Label validation engine
//!
//! [`LabelValidator`] runs one document through a linear sequence of phases:
//!
//! ```text
//! Idle -> Schema -> Rules -> Extensions -> Done
//! ```
//!
//! The schema phase parses the document and validates it structurally; with
//! schema checking disabled the document is only parsed. The rule phase runs
//! the configured (or document-declared) rule transforms. The extension phase
//! runs the registered [`HookSet`]. Fatal problems abort the run with an
//! error; everything else becomes a [`Diagnostic`].
//!
//! One engine serializes its runs behind a mutex held for the whole
//! validation. Separate engines share nothing and may run in parallel.
//! Compiled schemas and rule transforms are created on first use and reused
//! until the configuration changes or [`LabelValidator::invalidate`] is called.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ResourceCache;
use crate::catalog::CatalogResolver;
use crate::config::Config;
use crate::diagnostic::{Diagnostic, Diagnostics};
use crate::document::{DocumentParser, LabelDocument};
use crate::error::{Result, ValidationError};
use crate::hooks::{DocumentValidator, ExternalValidator, HookSet};
use crate::libxml2::{ParseOptions, ResolverScope};
use crate::location;
use crate::resource_loader::ResourceLoader;
use crate::resources::{self, DirectoryResources, ModelResources};
use crate::rules::{RuleEvaluator, RuleSource, RuleTransformCache};
use crate::schema::{
    CompiledSchema, SchemaCache, SchemaCompiler, SchemaSelection, SchemaSourceSet,
    SelectionInputs, select_schema_sources,
};
use crate::schematron::CompiledRuleTransform;

/// Phase of a validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValidationPhase {
    Idle,
    /// Parsing and structural validation
    Schema,
    /// Rule transform evaluation
    Rules,
    /// Extension validators
    Extensions,
    Done,
}

impl ValidationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationPhase::Idle => "idle",
            ValidationPhase::Schema => "schema",
            ValidationPhase::Rules => "rules",
            ValidationPhase::Extensions => "extensions",
            ValidationPhase::Done => "done",
        }
    }
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback notified of every phase a run enters
pub type PhaseObserver = Arc<dyn Fn(&str, ValidationPhase) + Send + Sync>;

/// Which checks run and where their sources come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationModes {
    pub schema_check: bool,
    /// Compile each document's declared schema instead of a shared one
    pub use_document_schema: bool,
    pub rule_check: bool,
    /// Use the rule sources named by the document's `xml-model` instructions
    pub use_document_rules: bool,
}

impl Default for ValidationModes {
    fn default() -> Self {
        Self {
            schema_check: true,
            use_document_schema: false,
            rule_check: true,
            use_document_rules: false,
        }
    }
}

/// Counters describing what an engine has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Completed and failed runs
    pub runs: u64,
    pub schema_compilations: u64,
    pub rule_compilations: u64,
    pub rule_cache_hits: u64,
    pub seeded_rules: usize,
}

/// Artifacts derived from the configuration, rebuilt lazily
#[derive(Default)]
struct EngineState {
    selection: Option<SchemaSelection>,
    schema: Option<Arc<CompiledSchema>>,
    transforms: Option<Vec<Arc<CompiledRuleTransform>>>,
    runs: u64,
}

impl EngineState {
    fn reset(&mut self) {
        self.selection = None;
        self.schema = None;
        self.transforms = None;
    }
}

/// Validates labels against schemas, rule sources and extension validators
pub struct LabelValidator {
    modes: ValidationModes,
    model_version: Option<String>,
    schema_sources: Vec<String>,
    rule_sources: Vec<RuleSource>,
    schema_directory: Option<PathBuf>,
    resources: Option<Arc<dyn ModelResources>>,
    loader: Arc<ResourceLoader>,
    compiler: SchemaCompiler,
    schemas: SchemaCache,
    rules: RuleTransformCache,
    parser: DocumentParser,
    hooks: HookSet,
    observer: Option<PhaseObserver>,
    state: Mutex<EngineState>,
}

impl LabelValidator {
    /// Engine without catalogs or a download cache
    pub fn new() -> Self {
        Self::with_loader(ResourceLoader::uncached(Arc::new(CatalogResolver::empty())))
    }

    pub fn with_loader(loader: ResourceLoader) -> Self {
        let loader = Arc::new(loader);
        Self {
            modes: ValidationModes::default(),
            model_version: None,
            schema_sources: Vec::new(),
            rule_sources: Vec::new(),
            schema_directory: None,
            resources: None,
            compiler: SchemaCompiler::new(loader.clone()),
            loader,
            schemas: SchemaCache::default(),
            rules: RuleTransformCache::default(),
            parser: DocumentParser::default(),
            hooks: HookSet::new(),
            observer: None,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Build an engine from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let resolver = if config.catalogs.is_empty() {
            CatalogResolver::empty()
        } else {
            CatalogResolver::load(&config.catalogs)?
        };
        let cache = ResourceCache::new(config.cache_config());
        for error in cache.prune_expired().errors {
            warn!(%error, "could not prune download cache");
        }
        let loader = ResourceLoader::new(
            Arc::new(resolver),
            Some(cache),
            config.http_client_config(),
        );

        let mut validator = Self::with_loader(loader);
        validator.modes = ValidationModes {
            schema_check: config.schema_check.enabled,
            use_document_schema: config.schema_check.use_document_schema,
            rule_check: config.rule_check.enabled,
            use_document_rules: config.rule_check.use_document_rules,
        };
        validator.parser = DocumentParser::new(config.parse_options());
        validator.schema_sources = config.schema_sources.clone();
        validator.rule_sources = config
            .rule_sources
            .iter()
            .map(|source| RuleSource::location(source.as_str()))
            .collect();
        validator.schema_directory = config.schema_directory.clone();
        if let Some(dir) = &config.resources_dir {
            validator.set_resources(Arc::new(DirectoryResources::new(dir)))?;
        }
        if let Some(version) = &config.model_version {
            validator.set_model_version(version.as_str())?;
        }
        Ok(validator)
    }

    // Configuration. Every change drops the derived artifacts.

    pub fn modes(&self) -> ValidationModes {
        self.modes
    }

    pub fn set_modes(&mut self, modes: ValidationModes) {
        self.modes = modes;
        self.reset();
    }

    pub fn set_schema_check(&mut self, enabled: bool, use_document_schema: bool) {
        self.modes.schema_check = enabled;
        self.modes.use_document_schema = use_document_schema;
        self.reset();
    }

    pub fn set_rule_check(&mut self, enabled: bool, use_document_rules: bool) {
        self.modes.rule_check = enabled;
        self.modes.use_document_rules = use_document_rules;
        self.reset();
    }

    /// Model version in effect: the one set, or the provider's default
    pub fn model_version(&self) -> Option<String> {
        self.model_version
            .clone()
            .or_else(|| self.resources.as_ref().and_then(|r| r.default_version()))
    }

    /// Select a model version. With a resources provider installed the
    /// version must be one it supports.
    pub fn set_model_version(&mut self, version: impl Into<String>) -> Result<()> {
        let version = version.into();
        if let Some(resources) = &self.resources {
            check_supported(resources.as_ref(), &version)?;
        }
        self.model_version = Some(version);
        self.reset();
        Ok(())
    }

    pub fn supported_versions(&self) -> Vec<String> {
        self.resources
            .as_ref()
            .map(|r| r.supported_versions())
            .unwrap_or_default()
    }

    pub fn set_resources(&mut self, resources: Arc<dyn ModelResources>) -> Result<()> {
        if let Some(version) = &self.model_version {
            check_supported(resources.as_ref(), version)?;
        }
        self.resources = Some(resources);
        self.reset();
        Ok(())
    }

    pub fn set_schema_sources(&mut self, sources: Vec<String>) {
        self.schema_sources = sources;
        self.reset();
    }

    pub fn add_schema_source(&mut self, source: impl Into<String>) {
        self.schema_sources.push(source.into());
        self.reset();
    }

    pub fn schema_sources(&self) -> &[String] {
        &self.schema_sources
    }

    pub fn set_schema_directory(&mut self, directory: Option<PathBuf>) {
        self.schema_directory = directory;
        self.reset();
    }

    pub fn set_rule_sources(&mut self, sources: Vec<RuleSource>) {
        self.rule_sources = sources;
        self.reset();
    }

    pub fn add_rule_source(&mut self, source: impl Into<RuleSource>) {
        self.rule_sources.push(source.into());
        self.reset();
    }

    pub fn rule_sources(&self) -> &[RuleSource] {
        &self.rule_sources
    }

    /// Pre-seed the transform cache; seeded entries survive `invalidate`.
    pub fn seed_rule_transform(&mut self, url: &str, transform: Arc<CompiledRuleTransform>) {
        self.rules.seed(url, transform);
        self.reset();
    }

    /// Replace the catalogs used for identifier resolution. The download
    /// cache is kept; compiled artifacts are dropped.
    pub fn set_catalogs<P: AsRef<Path>>(&mut self, catalogs: &[P]) -> Result<()> {
        let resolver = CatalogResolver::load(catalogs)?;
        self.loader = Arc::new(self.loader.with_resolver(Arc::new(resolver)));
        self.compiler = self.compiler.with_loader(self.loader.clone());
        self.schemas.invalidate();
        self.rules.invalidate();
        self.reset();
        Ok(())
    }

    pub fn catalogs(&self) -> Vec<String> {
        self.loader.resolver().locations().map(str::to_string).collect()
    }

    pub fn set_parse_options(&mut self, options: ParseOptions) {
        self.parser = DocumentParser::new(options);
    }

    pub fn add_external_validator(&mut self, validator: Box<dyn ExternalValidator>) {
        self.hooks.add_external(validator);
    }

    pub fn add_document_validator(&mut self, validator: Box<dyn DocumentValidator>) {
        self.hooks.add_document(validator);
    }

    pub fn set_phase_observer(&mut self, observer: PhaseObserver) {
        self.observer = Some(observer);
    }

    /// Drop compiled schemas and transforms, keeping seeded transforms.
    /// Also clears a poisoned engine lock.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.reset();
        self.state.clear_poison();
        self.schemas.invalidate();
        self.rules.invalidate();
        debug!("validator caches invalidated");
    }

    pub fn stats(&self) -> EngineStats {
        let runs = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .runs;
        let rules = self.rules.stats();
        EngineStats {
            runs,
            schema_compilations: self.compiler.compilations(),
            rule_compilations: rules.compilations,
            rule_cache_hits: rules.hits,
            seeded_rules: rules.seeded,
        }
    }

    fn reset(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.state.clear_poison();
    }

    // Validation

    /// Validate the document at `document` (URL or path), appending every
    /// diagnostic to `diagnostics`. On error nothing is appended.
    pub fn validate(&self, diagnostics: &mut Diagnostics, document: &str) -> Result<()> {
        let mut state = self.lock()?;
        let _scope = ResolverScope::enter(self.loader.clone());
        let resource = self.loader.fetch(document)?;
        let collected = self.run(&mut state, &resource.data, &resource.location)?;
        diagnostics.extend(collected);
        Ok(())
    }

    pub fn validate_path(&self, diagnostics: &mut Diagnostics, path: &Path) -> Result<()> {
        self.validate(diagnostics, &path.to_string_lossy())
    }

    /// Validate an in-memory document; `base_uri` resolves its relative
    /// references and names it in diagnostics.
    pub fn validate_bytes(
        &self,
        diagnostics: &mut Diagnostics,
        bytes: &[u8],
        base_uri: &str,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let _scope = ResolverScope::enter(self.loader.clone());
        let locator = location::canonical(base_uri);
        let collected = self.run(&mut state, bytes, &locator)?;
        diagnostics.extend(collected);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state.lock().map_err(|_| ValidationError::Concurrency {
            details: "validator state lock poisoned by an earlier panic".to_string(),
        })
    }

    fn enter_phase(&self, locator: &str, phase: ValidationPhase) {
        info!(%locator, %phase, "validation phase");
        if let Some(observer) = &self.observer {
            observer(locator, phase);
        }
    }

    fn run(&self, state: &mut EngineState, bytes: &[u8], locator: &str) -> Result<Vec<Diagnostic>> {
        state.runs += 1;
        self.enter_phase(locator, ValidationPhase::Idle);
        let mut diagnostics = Vec::new();

        let document = if self.modes.schema_check {
            self.enter_phase(locator, ValidationPhase::Schema);
            self.schema_phase(state, bytes, locator, &mut diagnostics)?
        } else {
            let (document, messages) = self.parser.parse(bytes, locator, None)?;
            diagnostics.extend(messages);
            document
        };

        if self.modes.rule_check {
            self.enter_phase(locator, ValidationPhase::Rules);
            self.rule_phase(state, &document, &mut diagnostics)?;
        }

        self.enter_phase(locator, ValidationPhase::Extensions);
        self.hooks.run(&document, &mut diagnostics)?;

        self.enter_phase(locator, ValidationPhase::Done);
        debug!(%locator, count = diagnostics.len(), "validation finished");
        Ok(diagnostics)
    }

    fn selection_inputs<'a>(&'a self, model_version: Option<&'a str>) -> SelectionInputs<'a> {
        SelectionInputs {
            explicit: &self.schema_sources,
            catalogs_configured: !self.loader.resolver().is_empty(),
            use_document_schema: self.modes.use_document_schema,
            model_version,
            resources: self.resources.as_deref(),
            schema_directory: self.schema_directory.as_deref(),
        }
    }

    fn schema_phase(
        &self,
        state: &mut EngineState,
        bytes: &[u8],
        locator: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<LabelDocument> {
        let selection = match state.selection.take() {
            Some(selection) => selection,
            None => {
                let version = self.model_version();
                let selection = select_schema_sources(self.selection_inputs(version.as_deref()))?;
                info!(selection = selection.name(), "schema sources selected");
                selection
            }
        };
        let selection = state.selection.insert(selection);

        if let Some(sources) = selection.fixed_sources() {
            let schema = match &state.schema {
                Some(schema) => schema.clone(),
                None => {
                    let schema = self.schemas.get_or_compile(sources, &self.compiler)?;
                    state.schema = Some(schema.clone());
                    schema
                }
            };
            let (document, found) = self.parser.parse(bytes, locator, Some(schema.as_ref()))?;
            if self.modes.use_document_schema {
                document.require_schema_declaration()?;
            }
            diagnostics.extend(found);
            return Ok(document);
        }

        let (document, found) = self.parser.parse(bytes, locator, None)?;
        diagnostics.extend(found);

        let declaration = if self.modes.use_document_schema {
            document.require_schema_declaration()?
        } else {
            document.schema_declaration()
        };
        let sources = SchemaSourceSet::from_declaration(&declaration, document.locator());
        if sources.is_empty() {
            diagnostics.push(Diagnostic::error(
                "No schema could be determined: the document declares no schema location",
                locator,
            ));
            return Ok(document);
        }

        let schema = match selection {
            SchemaSelection::DocumentDeclared => Arc::new(self.compiler.compile(&sources)?),
            _ => self.schemas.get_or_compile(&sources, &self.compiler)?,
        };
        diagnostics.extend(document.validate(&schema)?);
        Ok(document)
    }

    fn rule_phase(
        &self,
        state: &mut EngineState,
        document: &LabelDocument,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        let evaluator = RuleEvaluator::new(&self.rules, &self.loader);
        let transforms = if self.modes.use_document_rules {
            evaluator.declared(document, diagnostics)?
        } else {
            match &state.transforms {
                Some(transforms) => transforms.clone(),
                None => {
                    let transforms = evaluator.configured(&self.default_rule_sources()?)?;
                    info!(count = transforms.len(), "rule transforms ready");
                    state.transforms = Some(transforms.clone());
                    transforms
                }
            }
        };
        evaluator.evaluate(&transforms, document, diagnostics);
        Ok(())
    }

    /// Configured rule sources, else the bundled ones for the model
    /// version, else rule sources found in the schema directory.
    fn default_rule_sources(&self) -> Result<Vec<RuleSource>> {
        if !self.rule_sources.is_empty() {
            return Ok(self.rule_sources.clone());
        }
        if let (Some(version), Some(resources)) = (self.model_version(), &self.resources) {
            let rules = resources.rules(&version)?;
            if !rules.is_empty() {
                return Ok(rules.into_iter().map(RuleSource::Location).collect());
            }
        }
        if let Some(dir) = &self.schema_directory {
            let (_, rules) = resources::directory_sources(dir)?;
            return Ok(rules.into_iter().map(RuleSource::Location).collect());
        }
        Ok(Vec::new())
    }
}

impl Default for LabelValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LabelValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelValidator")
            .field("modes", &self.modes)
            .field("model_version", &self.model_version)
            .field("schema_sources", &self.schema_sources)
            .field("rule_sources", &self.rule_sources.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

fn check_supported(resources: &dyn ModelResources, version: &str) -> Result<()> {
    let supported = resources.supported_versions();
    if supported.iter().any(|v| v == version) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedModelVersion {
            version: version.to_string(),
            supported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Severity;
    use crate::resources::StaticResources;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="Product">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="title" type="xs:string"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

    const RULES: &str = r#"<sch:schema xmlns:sch="http://purl.oclc.org/dsdl/schematron">
  <sch:pattern>
    <sch:rule context="Product">
      <sch:assert test="title = 'Mars'">Title must be Mars</sch:assert>
    </sch:rule>
  </sch:pattern>
</sch:schema>"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_phases_in_order() {
        let dir = TempDir::new().unwrap();
        let mut validator = LabelValidator::new();
        validator.add_schema_source(write(&dir, "product.xsd", SCHEMA));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        validator.set_phase_observer(Arc::new(move |_: &str, phase| {
            recorder.lock().unwrap().push(phase);
        }));

        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(&mut diagnostics, b"<Product><title>Mars</title></Product>", "a.xml")
            .unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ValidationPhase::Idle,
                ValidationPhase::Schema,
                ValidationPhase::Rules,
                ValidationPhase::Extensions,
                ValidationPhase::Done
            ]
        );
    }

    #[test]
    fn test_disabled_phases_are_skipped() {
        let mut validator = LabelValidator::new();
        validator.set_schema_check(false, false);
        validator.set_rule_check(false, false);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        validator.set_phase_observer(Arc::new(move |_: &str, phase| {
            recorder.lock().unwrap().push(phase);
        }));

        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(&mut diagnostics, b"<anything/>", "a.xml")
            .unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ValidationPhase::Idle,
                ValidationPhase::Extensions,
                ValidationPhase::Done
            ]
        );
    }

    #[test]
    fn test_no_schema_source_is_config_error() {
        let validator = LabelValidator::new();
        let mut diagnostics = Diagnostics::new();
        let error = validator
            .validate_bytes(&mut diagnostics, b"<Product/>", "a.xml")
            .unwrap_err();
        assert!(matches!(error, ValidationError::Config(_)));
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_rule_failure_becomes_diagnostic() {
        let dir = TempDir::new().unwrap();
        let mut validator = LabelValidator::new();
        validator.add_schema_source(write(&dir, "product.xsd", SCHEMA));
        validator.add_rule_source(write(&dir, "rules.sch", RULES).as_str());

        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(
                &mut diagnostics,
                b"<Product><title>Venus</title></Product>",
                "venus.xml",
            )
            .unwrap();

        assert_eq!(diagnostics.len(), 1);
        let diagnostic = &diagnostics.as_slice()[0];
        assert_eq!(diagnostic.severity(), Severity::Error);
        assert_eq!(diagnostic.message(), "Title must be Mars");
        assert_eq!(diagnostic.failed_test(), Some("title = 'Mars'"));
    }

    #[test]
    fn test_model_version_checked_against_resources() {
        let mut validator = LabelValidator::new();
        validator
            .set_resources(Arc::new(StaticResources::new().with_version(
                "1.1.0.0",
                vec![],
                vec![],
            )))
            .unwrap();
        assert_eq!(validator.model_version().as_deref(), Some("1.1.0.0"));

        match validator.set_model_version("9.9.9.9").unwrap_err() {
            ValidationError::UnsupportedModelVersion { version, supported } => {
                assert_eq!(version, "9.9.9.9");
                assert_eq!(supported, vec!["1.1.0.0"]);
            }
            other => panic!("Expected UnsupportedModelVersion, got {other:?}"),
        }
        validator.set_model_version("1.1.0.0").unwrap();
    }

    #[test]
    fn test_schema_compiled_once_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let mut validator = LabelValidator::new();
        validator.add_schema_source(write(&dir, "product.xsd", SCHEMA));
        validator.set_rule_check(false, false);

        for _ in 0..3 {
            let mut diagnostics = Diagnostics::new();
            validator
                .validate_bytes(&mut diagnostics, b"<Product><title>x</title></Product>", "a.xml")
                .unwrap();
        }
        assert_eq!(validator.stats().schema_compilations, 1);
        assert_eq!(validator.stats().runs, 3);

        validator.invalidate();
        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(&mut diagnostics, b"<Product><title>x</title></Product>", "a.xml")
            .unwrap();
        assert_eq!(validator.stats().schema_compilations, 2);
    }
}
