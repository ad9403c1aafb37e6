//! Fixtures shared by the integration tests
#![allow(dead_code)]

use std::path::PathBuf;

use label_validator::{Diagnostics, LabelValidator, Severity};
use tempfile::TempDir;

pub const PDS_NS: &str = "urn:nasa:pds:test";

/// Namespaced product schema
pub const PRODUCT_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    targetNamespace="urn:nasa:pds:test" xmlns="urn:nasa:pds:test"
    elementFormDefault="qualified">
  <xs:element name="Product_Observational">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="title" type="xs:string"/>
        <xs:element name="target" type="xs:string" minOccurs="0"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

/// Schematron with one unconditional-looking check on the title
pub const TITLE_RULES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sch:schema xmlns:sch="http://purl.oclc.org/dsdl/schematron" queryBinding="xslt2">
  <sch:ns prefix="pds" uri="urn:nasa:pds:test"/>
  <sch:pattern id="title-check">
    <sch:rule context="pds:Product_Observational">
      <sch:assert test="pds:title = 'Mars'">
        The title must be Mars.
      </sch:assert>
    </sch:rule>
  </sch:pattern>
</sch:schema>"#;

/// Schematron whose assertions always hold for well-formed products
pub const PASSING_RULES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sch:schema xmlns:sch="http://purl.oclc.org/dsdl/schematron">
  <sch:ns prefix="pds" uri="urn:nasa:pds:test"/>
  <sch:pattern>
    <sch:rule context="pds:Product_Observational">
      <sch:assert test="count(pds:title) = 1">Exactly one title is required.</sch:assert>
    </sch:rule>
  </sch:pattern>
</sch:schema>"#;

/// A label with the given title and no schema or rule declarations
pub fn label(title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Product_Observational xmlns="urn:nasa:pds:test">
  <title>{title}</title>
</Product_Observational>"#
    )
}

/// A label declaring its schema through `xsi:schemaLocation`
pub fn label_with_schema_hint(title: &str, schema_location: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Product_Observational xmlns="urn:nasa:pds:test"
    xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xsi:schemaLocation="urn:nasa:pds:test {schema_location}">
  <title>{title}</title>
</Product_Observational>"#
    )
}

/// A label declaring rule sources through `xml-model` instructions
pub fn label_with_rules(title: &str, rule_hrefs: &[&str]) -> String {
    let instructions: String = rule_hrefs
        .iter()
        .map(|href| {
            format!(
                "<?xml-model href=\"{href}\" schematypens=\"http://purl.oclc.org/dsdl/schematron\"?>\n"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
{instructions}<Product_Observational xmlns="urn:nasa:pds:test">
  <title>{title}</title>
</Product_Observational>"#
    )
}

/// Temporary directory holding schemas, rules and labels for one test
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a file (creating parent directories) and return its path
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create directory");
        }
        std::fs::write(&path, content).expect("Failed to write fixture");
        path
    }

    /// Write a file and return its location as a string
    pub fn write_location(&self, name: &str, content: &str) -> String {
        self.write(name, content).to_string_lossy().into_owned()
    }

    /// `file:` URL of a file in the workspace
    pub fn url(&self, name: &str) -> String {
        url::Url::from_file_path(self.path(name))
            .expect("Absolute path")
            .to_string()
    }
}

/// Validator using the workspace's product schema
pub fn validator_with_schema(workspace: &Workspace) -> LabelValidator {
    let mut validator = LabelValidator::new();
    validator.add_schema_source(workspace.write_location("product.xsd", PRODUCT_XSD));
    validator
}

/// Validate a file and return the diagnostics, panicking on error
pub fn diagnostics_for(validator: &LabelValidator, path: &PathBuf) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    validator
        .validate_path(&mut diagnostics, path)
        .expect("Validation failed");
    diagnostics
}

pub fn severities(diagnostics: &Diagnostics) -> Vec<Severity> {
    diagnostics.iter().map(|d| d.severity()).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
