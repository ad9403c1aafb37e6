use divan::Bencher;
use label_validator::{CompiledRuleTransform, Diagnostics, LabelValidator};
use tempfile::TempDir;

fn main() {
    divan::main();
}

const PRODUCT_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
    targetNamespace="urn:nasa:pds:test" xmlns="urn:nasa:pds:test"
    elementFormDefault="qualified">
    <xs:element name="Product_Observational">
        <xs:complexType>
            <xs:sequence>
                <xs:element name="title" type="xs:string"/>
            </xs:sequence>
        </xs:complexType>
    </xs:element>
</xs:schema>"#;

const TITLE_RULES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sch:schema xmlns:sch="http://purl.oclc.org/dsdl/schematron">
    <sch:ns prefix="pds" uri="urn:nasa:pds:test"/>
    <sch:pattern>
        <sch:rule context="pds:Product_Observational">
            <sch:assert test="pds:title = 'Mars'">The title must be Mars.</sch:assert>
        </sch:rule>
    </sch:pattern>
</sch:schema>"#;

const LABEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Product_Observational xmlns="urn:nasa:pds:test">
    <title>Venus</title>
</Product_Observational>"#;

/// Engine configured with a schema and a rule source on disk
fn engine() -> (TempDir, LabelValidator) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let schema = dir.path().join("product.xsd");
    let rules = dir.path().join("rules.sch");
    std::fs::write(&schema, PRODUCT_XSD).expect("Failed to write schema");
    std::fs::write(&rules, TITLE_RULES).expect("Failed to write rules");

    let mut validator = LabelValidator::new();
    validator.add_schema_source(schema.to_string_lossy());
    validator.add_rule_source(rules.to_string_lossy().into_owned());
    (dir, validator)
}

#[divan::bench]
fn validate_cached(bencher: Bencher) {
    let (dir, validator) = engine();
    let base = dir.path().join("label.xml").to_string_lossy().into_owned();

    bencher.bench_local(move || {
        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(&mut diagnostics, LABEL.as_bytes(), &base)
            .expect("Validation failed");
        diagnostics
    });
}

#[divan::bench]
fn validate_after_invalidate(bencher: Bencher) {
    let (dir, validator) = engine();
    let base = dir.path().join("label.xml").to_string_lossy().into_owned();

    bencher.bench_local(move || {
        validator.invalidate();
        let mut diagnostics = Diagnostics::new();
        validator
            .validate_bytes(&mut diagnostics, LABEL.as_bytes(), &base)
            .expect("Validation failed");
        diagnostics
    });
}

#[divan::bench]
fn compile_rule_transform() -> CompiledRuleTransform {
    CompiledRuleTransform::compile("bench://rules.sch", divan::black_box(TITLE_RULES))
        .expect("Failed to compile rules")
}
