//! # label-validator
//!
//! Validation engine for PDS4 product labels: XML documents are checked
//! against XSD schemas and schematron rule sources, and every finding is
//! reported as a severity-classified [`Diagnostic`].
//!
//! ```no_run
//! use label_validator::{Diagnostics, LabelValidator};
//!
//! let mut validator = LabelValidator::new();
//! validator.add_schema_source("schemas/PDS4_PDS_1100.xsd");
//! validator.add_rule_source("schemas/PDS4_PDS_1100.sch");
//!
//! let mut diagnostics = Diagnostics::new();
//! validator.validate(&mut diagnostics, "bundle/label.xml")?;
//! for diagnostic in &diagnostics {
//!     println!("{diagnostic}");
//! }
//! # Ok::<(), label_validator::ValidationError>(())
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod diagnostic;
pub mod document;
pub mod error;
pub mod file_discovery;
pub mod hooks;
pub mod http_client;
pub mod libxml2;
pub mod location;
mod markup;
pub mod resource_loader;
pub mod resources;
pub mod rules;
pub mod schema;
pub mod schematron;
pub mod validator;

pub use cache::{CacheConfig, ResourceCache};
pub use catalog::CatalogResolver;
pub use config::{Config, ConfigManager, EnvProvider, SystemEnvProvider};
pub use diagnostic::{Diagnostic, Diagnostics, Severity};
pub use document::{DocumentParser, LabelDocument, ProcessingInstruction, SchemaDeclaration};
pub use error::{ConfigError, LibXml2Error, Result, ValidationError};
pub use file_discovery::FileDiscovery;
pub use hooks::{DocumentValidator, ExternalValidator, HookSet};
pub use http_client::{HttpClient, HttpClientConfig};
pub use libxml2::ParseOptions;
pub use resource_loader::ResourceLoader;
pub use resources::{DirectoryResources, ModelResources, StaticResources};
pub use rules::{RuleCacheStats, RuleReference, RuleSource, RuleTransformCache};
pub use schema::{CompiledSchema, SchemaCompiler, SchemaSelection, SchemaSourceSet};
pub use schematron::{CompiledRuleTransform, ReportEntry, ReportKind, RuleReport};
pub use validator::{EngineStats, LabelValidator, PhaseObserver, ValidationModes, ValidationPhase};
