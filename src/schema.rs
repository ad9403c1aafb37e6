//! Schema source selection and compilation
//!
//! [`select_schema_sources`] applies the source precedence (explicit list,
//! catalog-only, document-declared, bundled, external directory).
//! [`SchemaCompiler`] turns a [`SchemaSourceSet`] into an immutable
//! [`CompiledSchema`]; [`SchemaCache`] memoizes compiled schemas by source set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;
use quick_xml::escape::escape;
use tracing::{debug, info};

use crate::document::SchemaDeclaration;
use crate::error::{LibXml2Error, Result, ValidationError};
use crate::libxml2::{self, ResolverScope, XmlSchemaPtr};
use crate::location;
use crate::markup;
use crate::resource_loader::ResourceLoader;
use crate::resources::{self, ModelResources};

/// Ordered list of schema locations compiled together
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaSourceSet {
    locations: Vec<String>,
}

impl SchemaSourceSet {
    pub fn new(locations: Vec<String>) -> Self {
        Self { locations }
    }

    /// Locations hinted by a document, resolved against its base URI.
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn from_declaration(declaration: &SchemaDeclaration, base: &str) -> Self {
        let mut locations: Vec<String> = Vec::new();
        for hint in declaration.locations() {
            let resolved = location::resolve(Some(base), hint).unwrap_or_else(|| hint.to_string());
            if !locations.contains(&resolved) {
                locations.push(resolved);
            }
        }
        Self { locations }
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Identity of the set, used as the memoization key
    pub fn key(&self) -> String {
        self.locations.join("\n")
    }
}

/// Where the schema for the current configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSelection {
    /// Caller-supplied schema locations
    Explicit(SchemaSourceSet),
    /// Each document's hints, redirected through the catalogs and memoized
    CatalogOnly,
    /// Each document's own hints, compiled fresh per document
    DocumentDeclared,
    /// Bundled defaults of a model version
    Bundled {
        version: String,
        sources: SchemaSourceSet,
    },
    /// Schemas found in an external directory
    Directory {
        path: PathBuf,
        sources: SchemaSourceSet,
    },
}

impl SchemaSelection {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaSelection::Explicit(_) => "explicit",
            SchemaSelection::CatalogOnly => "catalog-only",
            SchemaSelection::DocumentDeclared => "document-declared",
            SchemaSelection::Bundled { .. } => "bundled",
            SchemaSelection::Directory { .. } => "directory",
        }
    }

    /// The fixed source set, for selections that do not depend on the document
    pub fn fixed_sources(&self) -> Option<&SchemaSourceSet> {
        match self {
            SchemaSelection::Explicit(sources)
            | SchemaSelection::Bundled { sources, .. }
            | SchemaSelection::Directory { sources, .. } => Some(sources),
            SchemaSelection::CatalogOnly | SchemaSelection::DocumentDeclared => None,
        }
    }
}

/// Everything that decides which schema sources apply
#[derive(Clone, Copy)]
pub struct SelectionInputs<'a> {
    pub explicit: &'a [String],
    pub catalogs_configured: bool,
    pub use_document_schema: bool,
    pub model_version: Option<&'a str>,
    pub resources: Option<&'a dyn ModelResources>,
    pub schema_directory: Option<&'a Path>,
}

/// Pick the schema sources, highest precedence first.
pub fn select_schema_sources(inputs: SelectionInputs<'_>) -> Result<SchemaSelection> {
    if !inputs.explicit.is_empty() {
        return Ok(SchemaSelection::Explicit(SchemaSourceSet::new(
            inputs.explicit.to_vec(),
        )));
    }
    if inputs.catalogs_configured {
        return Ok(SchemaSelection::CatalogOnly);
    }
    if inputs.use_document_schema {
        return Ok(SchemaSelection::DocumentDeclared);
    }
    if let (Some(version), Some(provider)) = (inputs.model_version, inputs.resources) {
        let schemas = provider.schemas(version)?;
        if !schemas.is_empty() {
            return Ok(SchemaSelection::Bundled {
                version: version.to_string(),
                sources: SchemaSourceSet::new(schemas),
            });
        }
    }
    if let Some(dir) = inputs.schema_directory {
        let (schemas, _) = resources::directory_sources(dir)?;
        if schemas.is_empty() {
            return Err(ValidationError::Config(format!(
                "No schema files found in {}",
                dir.display()
            )));
        }
        return Ok(SchemaSelection::Directory {
            path: dir.to_path_buf(),
            sources: SchemaSourceSet::new(schemas),
        });
    }
    Err(ValidationError::Config(
        "No schema sources available: configure schema sources, catalogs, \
         a model version with bundled resources, or a schema directory"
            .to_string(),
    ))
}

/// An immutable compiled schema and the sources it came from
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    schema: XmlSchemaPtr,
    sources: SchemaSourceSet,
}

impl CompiledSchema {
    pub fn sources(&self) -> &SchemaSourceSet {
        &self.sources
    }

    /// Whether both values share one compiled schema
    pub fn same_as(&self, other: &CompiledSchema) -> bool {
        self.schema.same_schema(&other.schema)
    }

    pub(crate) fn handle(&self) -> &XmlSchemaPtr {
        &self.schema
    }
}

/// Compiles schema source sets through the resource loader's catalogs
pub struct SchemaCompiler {
    loader: Arc<ResourceLoader>,
    compilations: AtomicU64,
}

impl SchemaCompiler {
    pub fn new(loader: Arc<ResourceLoader>) -> Self {
        Self {
            loader,
            compilations: AtomicU64::new(0),
        }
    }

    /// Compiler reading through a different loader; the compilation count
    /// carries over.
    pub fn with_loader(&self, loader: Arc<ResourceLoader>) -> Self {
        Self {
            loader,
            compilations: AtomicU64::new(self.compilations()),
        }
    }

    /// Number of successful compilations so far
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn compile(&self, sources: &SchemaSourceSet) -> Result<CompiledSchema> {
        if sources.is_empty() {
            return Err(ValidationError::SchemaCompilation {
                sources: Vec::new(),
                details: "empty schema source set".to_string(),
            });
        }

        let _scope = ResolverScope::enter(self.loader.clone());
        let parsed = match sources.locations() {
            [single] => libxml2::parse_schema_from_location(&self.loader.resolve(single)),
            many => {
                let driver = self.driver_schema(many)?;
                debug!(sources = many.len(), "compiling driver schema");
                libxml2::parse_schema_from_memory(driver.as_bytes())
            }
        };

        let schema = parsed.map_err(|e| match e {
            LibXml2Error::SchemaParseFailed { details } => ValidationError::SchemaCompilation {
                sources: sources.locations().to_vec(),
                details,
            },
            other => other.into(),
        })?;

        self.compilations.fetch_add(1, Ordering::Relaxed);
        info!(sources = ?sources.locations(), "compiled schema");
        Ok(CompiledSchema {
            schema,
            sources: sources.clone(),
        })
    }

    /// A schema importing each namespaced source and including the rest
    fn driver_schema(&self, locations: &[String]) -> Result<String> {
        let mut driver = String::from(
            "<xs:schema xmlns:xs=\"http://www.w3.org/2001/XMLSchema\">\n",
        );
        for source in locations {
            let resource = self.loader.fetch(source).map_err(|e| {
                ValidationError::SchemaCompilation {
                    sources: locations.to_vec(),
                    details: format!("cannot read {}: {}", source, e),
                }
            })?;
            let attributes = markup::root_attributes(&resource.text()).map_err(|e| {
                ValidationError::SchemaCompilation {
                    sources: locations.to_vec(),
                    details: format!("{}: {}", resource.location, e),
                }
            })?;
            let target_namespace = attributes
                .iter()
                .find(|a| a.name == "targetNamespace")
                .map(|a| a.value.as_str())
                .filter(|ns| !ns.is_empty());

            let schema_location = escape(resource.location.as_str());
            match target_namespace {
                Some(ns) => driver.push_str(&format!(
                    "  <xs:import namespace=\"{}\" schemaLocation=\"{}\"/>\n",
                    escape(ns),
                    schema_location
                )),
                None => driver.push_str(&format!(
                    "  <xs:include schemaLocation=\"{}\"/>\n",
                    schema_location
                )),
            }
        }
        driver.push_str("</xs:schema>\n");
        Ok(driver)
    }
}

/// Compiled schemas memoized by source set
pub struct SchemaCache {
    compiled: Cache<String, Arc<CompiledSchema>>,
}

impl SchemaCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            compiled: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    pub fn get_or_compile(
        &self,
        sources: &SchemaSourceSet,
        compiler: &SchemaCompiler,
    ) -> Result<Arc<CompiledSchema>> {
        let key = sources.key();
        if let Some(schema) = self.compiled.get(&key) {
            debug!(sources = sources.locations().len(), "schema cache hit");
            return Ok(schema);
        }
        self.compiled
            .try_get_with(key, || compiler.compile(sources).map(Arc::new))
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| ValidationError::SchemaCompilation {
                    sources: sources.locations().to_vec(),
                    details: shared.to_string(),
                })
            })
    }

    pub fn invalidate(&self) {
        self.compiled.invalidate_all();
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogResolver;
    use crate::resources::StaticResources;
    use tempfile::TempDir;

    const NS_XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    targetNamespace="urn:a" xmlns="urn:a" elementFormDefault="qualified">
  <xs:element name="a" type="xs:string"/>
</xs:schema>"#;

    const PLAIN_XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="b" type="xs:int"/>
</xs:schema>"#;

    fn compiler() -> SchemaCompiler {
        SchemaCompiler::new(Arc::new(ResourceLoader::uncached(Arc::new(
            CatalogResolver::empty(),
        ))))
    }

    fn inputs<'a>(explicit: &'a [String]) -> SelectionInputs<'a> {
        SelectionInputs {
            explicit,
            catalogs_configured: false,
            use_document_schema: false,
            model_version: None,
            resources: None,
            schema_directory: None,
        }
    }

    #[test]
    fn test_selection_precedence() {
        let explicit = vec!["a.xsd".to_string()];
        let resources = StaticResources::new().with_version("1.0", vec!["bundled.xsd".into()], vec![]);

        let all = SelectionInputs {
            catalogs_configured: true,
            use_document_schema: true,
            model_version: Some("1.0"),
            resources: Some(&resources),
            ..inputs(&explicit)
        };
        assert!(matches!(select_schema_sources(all).unwrap(), SchemaSelection::Explicit(_)));

        let no_explicit = SelectionInputs { explicit: &[], ..all };
        assert_eq!(select_schema_sources(no_explicit).unwrap(), SchemaSelection::CatalogOnly);

        let no_catalog = SelectionInputs { catalogs_configured: false, ..no_explicit };
        assert_eq!(select_schema_sources(no_catalog).unwrap(), SchemaSelection::DocumentDeclared);

        let bundled = SelectionInputs { use_document_schema: false, ..no_catalog };
        match select_schema_sources(bundled).unwrap() {
            SchemaSelection::Bundled { version, sources } => {
                assert_eq!(version, "1.0");
                assert_eq!(sources.locations(), ["bundled.xsd".to_string()]);
            }
            other => panic!("Expected bundled selection, got {:?}", other),
        }

        let nothing = SelectionInputs { resources: None, ..bundled };
        assert!(matches!(select_schema_sources(nothing), Err(ValidationError::Config(_))));
    }

    #[test]
    fn test_directory_selection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.xsd"), PLAIN_XSD).unwrap();
        let selection = select_schema_sources(SelectionInputs {
            schema_directory: Some(dir.path()),
            ..inputs(&[])
        })
        .unwrap();
        assert_eq!(selection.name(), "directory");
        assert_eq!(selection.fixed_sources().unwrap().locations().len(), 1);

        let empty = TempDir::new().unwrap();
        assert!(select_schema_sources(SelectionInputs {
            schema_directory: Some(empty.path()),
            ..inputs(&[])
        })
        .is_err());
    }

    #[test]
    fn test_compile_single_and_multiple_sources() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.xsd");
        let b = dir.path().join("b.xsd");
        std::fs::write(&a, NS_XSD).unwrap();
        std::fs::write(&b, PLAIN_XSD).unwrap();
        let compiler = compiler();

        let single = SchemaSourceSet::new(vec![a.to_string_lossy().into_owned()]);
        compiler.compile(&single).unwrap();

        let both = SchemaSourceSet::new(vec![
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ]);
        let compiled = compiler.compile(&both).unwrap();
        assert_eq!(compiled.sources().locations().len(), 2);
        assert_eq!(compiler.compilations(), 2);
    }

    #[test]
    fn test_malformed_schema_is_compilation_error() {
        let dir = TempDir::new().unwrap();
        let broken = dir.path().join("broken.xsd");
        std::fs::write(&broken, "<xs:schema xmlns:xs=\"http://www.w3.org/2001/XMLSchema\"><xs:element/></xs:schema>").unwrap();

        let result = compiler().compile(&SchemaSourceSet::new(vec![broken.to_string_lossy().into_owned()]));
        match result {
            Err(ValidationError::SchemaCompilation { sources, details }) => {
                assert_eq!(sources.len(), 1);
                assert!(!details.is_empty());
            }
            other => panic!("Expected SchemaCompilation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_source_in_multi_set() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.xsd");
        std::fs::write(&a, NS_XSD).unwrap();
        let set = SchemaSourceSet::new(vec![
            a.to_string_lossy().into_owned(),
            dir.path().join("gone.xsd").to_string_lossy().into_owned(),
        ]);
        assert!(matches!(
            compiler().compile(&set),
            Err(ValidationError::SchemaCompilation { .. })
        ));
    }

    #[test]
    fn test_cache_memoizes_by_source_set() {
        let dir = TempDir::new().unwrap();
        let b = dir.path().join("b.xsd");
        std::fs::write(&b, PLAIN_XSD).unwrap();
        let compiler = compiler();
        let cache = SchemaCache::default();
        let set = SchemaSourceSet::new(vec![b.to_string_lossy().into_owned()]);

        let first = cache.get_or_compile(&set, &compiler).unwrap();
        let second = cache.get_or_compile(&set, &compiler).unwrap();
        assert!(first.same_as(&second));
        assert_eq!(compiler.compilations(), 1);

        cache.invalidate();
        let third = cache.get_or_compile(&set, &compiler).unwrap();
        assert!(!first.same_as(&third));
        assert_eq!(compiler.compilations(), 2);
    }

    #[test]
    fn test_sources_from_declaration() {
        let declaration = SchemaDeclaration {
            schema_locations: vec![
                ("urn:a".to_string(), "a.xsd".to_string()),
                ("urn:b".to_string(), "http://example.com/b.xsd".to_string()),
                ("urn:a".to_string(), "a.xsd".to_string()),
            ],
            no_namespace_location: None,
        };
        let set = SchemaSourceSet::from_declaration(&declaration, "file:///labels/label.xml");
        assert_eq!(
            set.locations(),
            ["file:///labels/a.xsd".to_string(), "http://example.com/b.xsd".to_string()]
        );
    }
}
