//! Label parsing and structural validation

use tracing::{debug, warn};

use crate::diagnostic::{Diagnostic, Severity};
use crate::error::{Result, ValidationError};
use crate::libxml2::{CompiledXPath, ParseOptions, XPathContext, XPathValue, XmlDocument, XmlMessage};
use crate::schema::CompiledSchema;

pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Schema hints declared on a document's root element
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaDeclaration {
    /// `(namespace, location)` pairs from `xsi:schemaLocation`
    pub schema_locations: Vec<(String, String)>,
    /// `xsi:noNamespaceSchemaLocation`
    pub no_namespace_location: Option<String>,
}

impl SchemaDeclaration {
    pub fn is_empty(&self) -> bool {
        self.schema_locations.is_empty() && self.no_namespace_location.is_none()
    }

    /// Declared locations in document order, the no-namespace one last
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.schema_locations
            .iter()
            .map(|(_, location)| location.as_str())
            .chain(self.no_namespace_location.as_deref())
    }
}

/// A processing instruction anywhere in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingInstruction {
    pub target: String,
    pub data: String,
    pub base_uri: Option<String>,
}

/// A parsed label
#[derive(Debug)]
pub struct LabelDocument {
    locator: String,
    xml: XmlDocument,
}

impl LabelDocument {
    /// URL or path the document was read from
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn root_name(&self) -> Option<String> {
        self.xml.root().and_then(|root| root.name())
    }

    pub fn schema_declaration(&self) -> SchemaDeclaration {
        let Some(root) = self.xml.root() else {
            return SchemaDeclaration::default();
        };

        let mut declaration = SchemaDeclaration {
            no_namespace_location: root
                .attribute_ns("noNamespaceSchemaLocation", Some(XSI_NAMESPACE))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            ..SchemaDeclaration::default()
        };

        if let Some(value) = root.attribute_ns("schemaLocation", Some(XSI_NAMESPACE)) {
            let tokens: Vec<&str> = value.split_whitespace().collect();
            if tokens.len() % 2 != 0 {
                warn!(locator = %self.locator, "odd number of xsi:schemaLocation tokens; ignoring the last");
            }
            declaration.schema_locations = tokens
                .chunks_exact(2)
                .map(|pair| (pair[0].to_string(), pair[1].to_string()))
                .collect();
        }
        declaration
    }

    /// The schema declaration, or an error when the root declares none
    pub fn require_schema_declaration(&self) -> Result<SchemaDeclaration> {
        let declaration = self.schema_declaration();
        if declaration.is_empty() {
            return Err(ValidationError::MissingSchemaDeclaration {
                locator: self.locator.clone(),
            });
        }
        Ok(declaration)
    }

    pub fn processing_instructions(&self) -> Result<Vec<ProcessingInstruction>> {
        let expr = CompiledXPath::compile("//processing-instruction()")?;
        let mut ctx = XPathContext::new(&self.xml)?;
        let value = ctx.evaluate(&expr, None)?;
        Ok(value
            .nodes(&self.xml)
            .into_iter()
            .map(|node| ProcessingInstruction {
                target: node.name().unwrap_or_default(),
                data: node.content(),
                base_uri: node.base_uri(),
            })
            .collect())
    }

    /// Structurally validate against a compiled schema. Never fails on
    /// violations; each one becomes a diagnostic.
    pub fn validate(&self, schema: &CompiledSchema) -> Result<Vec<Diagnostic>> {
        let messages = self.xml.validate(schema.handle())?;
        debug!(locator = %self.locator, violations = messages.len(), "structural validation");
        Ok(messages
            .iter()
            .map(|m| message_diagnostic(m, &self.locator))
            .collect())
    }

    pub fn xpath_boolean(&self, expression: &str, namespaces: &[(&str, &str)]) -> Result<bool> {
        self.query(expression, namespaces, |value, _| value.to_boolean())
    }

    pub fn xpath_string(&self, expression: &str, namespaces: &[(&str, &str)]) -> Result<String> {
        self.query(expression, namespaces, |value, _| value.to_string_value())
    }

    pub fn xpath_count(&self, expression: &str, namespaces: &[(&str, &str)]) -> Result<usize> {
        self.query(expression, namespaces, |value, doc| value.nodes(doc).len())
    }

    /// String value of every node selected by `expression`
    pub fn xpath_strings(&self, expression: &str, namespaces: &[(&str, &str)]) -> Result<Vec<String>> {
        self.query(expression, namespaces, |value, doc| {
            value.nodes(doc).iter().map(|node| node.content()).collect()
        })
    }

    fn query<T>(
        &self,
        expression: &str,
        namespaces: &[(&str, &str)],
        extract: impl FnOnce(&XPathValue, &XmlDocument) -> T,
    ) -> Result<T> {
        let expr = CompiledXPath::compile(expression)?;
        let mut ctx = XPathContext::new(&self.xml)?;
        for (prefix, uri) in namespaces {
            ctx.register_namespace(prefix, uri)?;
        }
        let value = ctx.evaluate(&expr, None)?;
        Ok(extract(&value, &self.xml))
    }

    pub(crate) fn xml(&self) -> &XmlDocument {
        &self.xml
    }
}

fn message_location(message: &XmlMessage) -> Option<String> {
    match (message.line, message.column) {
        (line, _) if line <= 0 => None,
        (line, column) if column <= 0 => Some(format!("line {}", line)),
        (line, column) => Some(format!("line {}, column {}", line, column)),
    }
}

fn message_diagnostic(message: &XmlMessage, locator: &str) -> Diagnostic {
    let severity = if message.is_warning() {
        Severity::Warning
    } else {
        Severity::Error
    };
    let diagnostic = Diagnostic::new(severity, message.message.clone(), locator);
    match message_location(message) {
        Some(location) => diagnostic.with_location(location),
        None => diagnostic,
    }
}

/// Reads labels into [`LabelDocument`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentParser {
    options: ParseOptions,
}

impl DocumentParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> ParseOptions {
        self.options
    }

    /// Parse `bytes` and, with a schema, validate structurally.
    ///
    /// Input that is not well-formed is an error; everything else the parser
    /// or validator reports comes back as diagnostics.
    pub fn parse(
        &self,
        bytes: &[u8],
        locator: &str,
        schema: Option<&CompiledSchema>,
    ) -> Result<(LabelDocument, Vec<Diagnostic>)> {
        let (xml, messages) = match XmlDocument::parse(bytes, locator, self.options)? {
            Ok(parsed) => parsed,
            Err(failure) => {
                let details = if failure.column > 0 {
                    format!("{} (column {})", failure.message, failure.column)
                } else {
                    failure.message
                };
                return Err(ValidationError::MalformedDocument {
                    locator: locator.to_string(),
                    line: failure.line,
                    details,
                });
            }
        };

        let document = LabelDocument {
            locator: locator.to_string(),
            xml,
        };
        let mut diagnostics: Vec<Diagnostic> = messages
            .iter()
            .map(|m| message_diagnostic(m, locator))
            .collect();

        if let Some(schema) = schema {
            diagnostics.extend(document.validate(schema)?);
        }
        Ok((document, diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogResolver;
    use crate::resource_loader::ResourceLoader;
    use crate::schema::{SchemaCompiler, SchemaSourceSet};
    use std::sync::Arc;
    use tempfile::TempDir;

    const LABEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<?xml-model href="rules.sch" schematypens="http://purl.oclc.org/dsdl/schematron"?>
<Product xmlns="urn:pds" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xsi:schemaLocation="urn:pds product.xsd">
  <title>Mars</title>
  <title>Phobos</title>
</Product>"#;

    const PRODUCT_XSD: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    targetNamespace="urn:pds" xmlns="urn:pds" elementFormDefault="qualified">
  <xs:element name="Product">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="title" type="xs:string" maxOccurs="1"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

    fn parse(xml: &str) -> (LabelDocument, Vec<Diagnostic>) {
        DocumentParser::default()
            .parse(xml.as_bytes(), "file:///labels/label.xml", None)
            .unwrap()
    }

    #[test]
    fn test_declaration_and_root() {
        let (document, diagnostics) = parse(LABEL);
        assert!(diagnostics.is_empty());
        assert_eq!(document.root_name().as_deref(), Some("Product"));

        let declaration = document.require_schema_declaration().unwrap();
        assert_eq!(
            declaration.schema_locations,
            vec![("urn:pds".to_string(), "product.xsd".to_string())]
        );
        assert_eq!(declaration.locations().collect::<Vec<_>>(), vec!["product.xsd"]);
    }

    #[test]
    fn test_missing_declaration() {
        let (document, _) = parse("<Product/>");
        assert!(document.schema_declaration().is_empty());
        match document.require_schema_declaration() {
            Err(ValidationError::MissingSchemaDeclaration { locator }) => {
                assert_eq!(locator, "file:///labels/label.xml")
            }
            other => panic!("Expected MissingSchemaDeclaration, got {:?}", other),
        }
    }

    #[test]
    fn test_processing_instructions() {
        let (document, _) = parse(LABEL);
        let pis = document.processing_instructions().unwrap();
        assert_eq!(pis.len(), 1);
        assert_eq!(pis[0].target, "xml-model");
        assert!(pis[0].data.contains("href=\"rules.sch\""));
        assert_eq!(pis[0].base_uri.as_deref(), Some("file:///labels/label.xml"));
    }

    #[test]
    fn test_xpath_helpers() {
        let (document, _) = parse(LABEL);
        let ns = [("p", "urn:pds")];
        assert_eq!(document.xpath_count("//p:title", &ns).unwrap(), 2);
        assert_eq!(document.xpath_string("string(//p:title[2])", &ns).unwrap(), "Phobos");
        assert!(document.xpath_boolean("count(//p:title) > 1", &ns).unwrap());
        assert_eq!(
            document.xpath_strings("//p:title", &ns).unwrap(),
            vec!["Mars", "Phobos"]
        );
        assert!(document.xpath_count("//p:title[", &ns).is_err());
    }

    #[test]
    fn test_malformed_input() {
        let result = DocumentParser::default().parse(b"<Product>\n<title></Product>", "bad.xml", None);
        match result {
            Err(ValidationError::MalformedDocument { locator, line, details }) => {
                assert_eq!(locator, "bad.xml");
                assert!(line >= 2);
                assert!(!details.is_empty());
            }
            other => panic!("Expected MalformedDocument, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_structural_violations_are_diagnostics() {
        let dir = TempDir::new().unwrap();
        let xsd = dir.path().join("product.xsd");
        std::fs::write(&xsd, PRODUCT_XSD).unwrap();
        let compiler = SchemaCompiler::new(Arc::new(ResourceLoader::uncached(Arc::new(
            CatalogResolver::empty(),
        ))));
        let schema = compiler
            .compile(&SchemaSourceSet::new(vec![xsd.to_string_lossy().into_owned()]))
            .unwrap();

        let (_, diagnostics) = DocumentParser::default()
            .parse(LABEL.as_bytes(), "file:///labels/label.xml", Some(&schema))
            .unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity(), Severity::Error);
        assert!(diagnostics[0].location().unwrap().starts_with("line 6"));

        let valid = LABEL.replace("  <title>Phobos</title>\n", "");
        let (_, diagnostics) = DocumentParser::default()
            .parse(valid.as_bytes(), "file:///labels/label.xml", Some(&schema))
            .unwrap();
        assert!(diagnostics.is_empty());
    }
}
