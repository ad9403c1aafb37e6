//! Schematron rule transforms
//!
//! A rule source is compiled once into a [`CompiledRuleTransform`]: namespace
//! bindings, variables and patterns whose every XPath is precompiled by
//! libxml2. Evaluating a transform against a [`LabelDocument`] yields a
//! [`RuleReport`] listing failed assertions and fired reports.
//!
//! Query binding is XPath 1.0 regardless of `queryBinding`; expressions that
//! need XPath 2.0 functions fail when evaluated.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::document::LabelDocument;
use crate::error::{LibXml2Result, Result, ValidationError};
use crate::libxml2::{CompiledXPath, XPathContext, XmlNodeRef};
use crate::markup::{self, Element, Node};

pub const ISO_SCHEMATRON_NAMESPACE: &str = "http://purl.oclc.org/dsdl/schematron";
pub const SCHEMATRON_15_NAMESPACE: &str = "http://www.ascc.net/xml/schematron";

const MAX_EXTENDS_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    /// An `assert` whose test was false
    FailedAssertion,
    /// A `report` whose test was true
    SuccessfulReport,
}

/// One line of a rule report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub kind: ReportKind,
    pub message: String,
    pub role: Option<String>,
    /// Path of the context node in the document
    pub location: String,
    pub test: String,
    pub id: Option<String>,
    pub flag: Option<String>,
}

/// Output of one transform run against one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    pub source: String,
    pub entries: Vec<ReportEntry>,
}

impl RuleReport {
    pub fn failed_assertions(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == ReportKind::FailedAssertion)
    }

    pub fn successful_reports(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == ReportKind::SuccessfulReport)
    }
}

#[derive(Debug)]
struct Variable {
    name: String,
    value: CompiledXPath,
}

#[derive(Debug)]
enum MessagePart {
    Text(String),
    Value(CompiledXPath),
}

#[derive(Debug)]
struct Check {
    kind: ReportKind,
    test: CompiledXPath,
    role: Option<String>,
    id: Option<String>,
    flag: Option<String>,
    message: Vec<MessagePart>,
}

#[derive(Debug)]
struct Rule {
    context: CompiledXPath,
    role: Option<String>,
    flag: Option<String>,
    variables: Vec<Variable>,
    checks: Vec<Check>,
}

#[derive(Debug)]
struct Pattern {
    id: Option<String>,
    variables: Vec<Variable>,
    rules: Vec<Rule>,
    /// Union of all rule contexts, yielding candidates in document order
    candidates: Option<CompiledXPath>,
}

/// An executable form of one schematron document
#[derive(Debug)]
pub struct CompiledRuleTransform {
    source: String,
    title: Option<String>,
    namespaces: Vec<(String, String)>,
    variables: Vec<Variable>,
    patterns: Vec<Pattern>,
}

impl CompiledRuleTransform {
    /// Compile schematron text read from `source`.
    pub fn compile(source: &str, text: &str) -> Result<Self> {
        let root = markup::parse(text).map_err(|e| ValidationError::RuleCompilation {
            url: source.to_string(),
            details: e.to_string(),
        })?;
        let transform = Compiler::new(source, &root)?.compile()?;
        debug!(
            %source,
            patterns = transform.patterns.len(),
            rules = transform.patterns.iter().map(|p| p.rules.len()).sum::<usize>(),
            "compiled rule transform"
        );
        Ok(transform)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn pattern_ids(&self) -> impl Iterator<Item = Option<&str>> {
        self.patterns.iter().map(|p| p.id.as_deref())
    }

    /// Run every pattern against `document`.
    ///
    /// Patterns run in source order. Within a pattern, candidate nodes are
    /// visited in document order and each is handled by the first rule whose
    /// context matches it.
    pub fn evaluate(&self, document: &LabelDocument) -> LibXml2Result<RuleReport> {
        let doc = document.xml();
        let mut ctx = XPathContext::new(doc)?;
        for (prefix, uri) in &self.namespaces {
            ctx.register_namespace(prefix, uri)?;
        }
        bind_variables(&mut ctx, &self.variables, None)?;

        let mut entries = Vec::new();
        for pattern in &self.patterns {
            let Some(candidates) = &pattern.candidates else {
                continue;
            };
            bind_variables(&mut ctx, &pattern.variables, None)?;

            let mut matched: Vec<HashSet<usize>> = Vec::with_capacity(pattern.rules.len());
            for rule in &pattern.rules {
                let nodes = ctx.evaluate(&rule.context, None)?.nodes(doc);
                matched.push(nodes.iter().map(XmlNodeRef::id).collect());
            }

            for node in ctx.evaluate(candidates, None)?.nodes(doc) {
                let Some(index) = matched.iter().position(|set| set.contains(&node.id())) else {
                    continue;
                };
                fire_rule(&mut ctx, &pattern.rules[index], node, &mut entries)?;
            }
        }

        ctx.clear_variables();
        Ok(RuleReport {
            source: self.source.clone(),
            entries,
        })
    }
}

fn bind_variables<'doc>(
    ctx: &mut XPathContext<'doc>,
    variables: &[Variable],
    node: Option<XmlNodeRef<'doc>>,
) -> LibXml2Result<()> {
    for variable in variables {
        let value = ctx.evaluate(&variable.value, node)?;
        ctx.register_variable(&variable.name, value)?;
    }
    Ok(())
}

fn fire_rule<'doc>(
    ctx: &mut XPathContext<'doc>,
    rule: &Rule,
    node: XmlNodeRef<'doc>,
    entries: &mut Vec<ReportEntry>,
) -> LibXml2Result<()> {
    bind_variables(ctx, &rule.variables, Some(node))?;

    for check in &rule.checks {
        let outcome = ctx.evaluate(&check.test, Some(node))?.to_boolean();
        let fired = match check.kind {
            ReportKind::FailedAssertion => !outcome,
            ReportKind::SuccessfulReport => outcome,
        };
        if !fired {
            continue;
        }

        let mut message = String::new();
        for part in &check.message {
            match part {
                MessagePart::Text(text) => message.push_str(text),
                MessagePart::Value(expr) => {
                    message.push_str(&ctx.evaluate(expr, Some(node))?.to_string_value())
                }
            }
        }

        entries.push(ReportEntry {
            kind: check.kind,
            message: message.trim().to_string(),
            role: check.role.clone().or_else(|| rule.role.clone()),
            location: node.path().unwrap_or_default(),
            test: check.test.expression().to_string(),
            id: check.id.clone(),
            flag: check.flag.clone().or_else(|| rule.flag.clone()),
        });
    }
    Ok(())
}

/// Anchor each union branch of a context pattern so it matches anywhere.
fn anchor_context(context: &str) -> String {
    split_union(context)
        .into_iter()
        .map(|branch| {
            let branch = branch.trim();
            if branch.starts_with('/') {
                branch.to_string()
            } else {
                format!("//{}", branch)
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Split on `|` outside brackets, parentheses and string literals.
fn split_union(expression: &str) -> Vec<&str> {
    let mut branches = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expression.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, '|') if depth == 0 => {
                branches.push(&expression[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    branches.push(&expression[start..]);
    branches
}

struct Compiler<'a> {
    source: &'a str,
    root: &'a Element,
    namespace: &'static str,
    abstract_rules: HashMap<&'a str, &'a Element>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, root: &'a Element) -> Result<Self> {
        let namespace = [ISO_SCHEMATRON_NAMESPACE, SCHEMATRON_15_NAMESPACE]
            .into_iter()
            .find(|ns| root.is(ns, "schema"))
            .ok_or_else(|| ValidationError::RuleCompilation {
                url: source.to_string(),
                details: format!(
                    "root element '{}' is not a schematron schema",
                    root.local
                ),
            })?;

        let mut compiler = Compiler {
            source,
            root,
            namespace,
            abstract_rules: HashMap::new(),
        };
        let mut abstract_rules = HashMap::new();
        compiler.collect_abstract_rules(root, &mut abstract_rules);
        compiler.abstract_rules = abstract_rules;
        Ok(compiler)
    }

    fn error(&self, details: impl Into<String>) -> ValidationError {
        ValidationError::RuleCompilation {
            url: self.source.to_string(),
            details: details.into(),
        }
    }

    fn children(&self, element: &'a Element, local: &'static str) -> impl Iterator<Item = &'a Element> + use<'a> {
        let namespace = self.namespace;
        element.elements().filter(move |e| e.is(namespace, local))
    }

    fn required<'e>(&self, element: &'e Element, attribute: &str) -> Result<&'e str> {
        element
            .attr(attribute)
            .ok_or_else(|| self.error(format!("<{}> requires a '{}' attribute", element.local, attribute)))
    }

    fn xpath(&self, expression: &str) -> Result<CompiledXPath> {
        CompiledXPath::compile(expression).map_err(|e| self.error(e.to_string()))
    }

    fn collect_abstract_rules(&self, element: &'a Element, into: &mut HashMap<&'a str, &'a Element>) {
        for child in element.elements() {
            if child.is(self.namespace, "rule")
                && child.attr("abstract") == Some("true")
                && let Some(id) = child.attr("id")
            {
                into.insert(id, child);
            } else if child.namespace.as_deref() == Some(self.namespace) {
                self.collect_abstract_rules(child, into);
            }
        }
    }

    fn compile(self) -> Result<CompiledRuleTransform> {
        if self.children(self.root, "include").next().is_some() {
            return Err(self.error("<include> is not supported; inline the included rules"));
        }

        let mut namespaces = Vec::new();
        for ns in self.children(self.root, "ns") {
            namespaces.push((
                self.required(ns, "prefix")?.to_string(),
                self.required(ns, "uri")?.to_string(),
            ));
        }

        let variables = self.variables(self.root)?;

        let mut patterns = Vec::new();
        for pattern in self.children(self.root, "pattern") {
            if pattern.attr("abstract") == Some("true") {
                continue;
            }
            if pattern.attr("is-a").is_some() {
                return Err(self.error("abstract pattern instantiation (is-a) is not supported"));
            }
            patterns.push(self.pattern(pattern)?);
        }

        Ok(CompiledRuleTransform {
            source: self.source.to_string(),
            title: self
                .children(self.root, "title")
                .next()
                .map(|t| markup::normalize_space(&t.text())),
            namespaces,
            variables,
            patterns,
        })
    }

    fn variables(&self, element: &'a Element) -> Result<Vec<Variable>> {
        self.children(element, "let")
            .map(|variable| {
                let name = self.required(variable, "name")?;
                let value = variable
                    .attr("value")
                    .ok_or_else(|| self.error(format!("let '{}' has no value attribute", name)))?;
                Ok(Variable {
                    name: name.to_string(),
                    value: self.xpath(value)?,
                })
            })
            .collect()
    }

    fn pattern(&self, pattern: &'a Element) -> Result<Pattern> {
        let mut rules = Vec::new();
        let mut contexts = Vec::new();
        for rule in self.children(pattern, "rule") {
            if rule.attr("abstract") == Some("true") {
                continue;
            }
            let context = anchor_context(self.required(rule, "context")?);
            let mut checks = Vec::new();
            let mut variables = self.variables(rule)?;
            self.rule_body(rule, &mut checks, &mut variables, 0)?;
            rules.push(Rule {
                context: self.xpath(&context)?,
                role: rule.attr("role").map(str::to_string),
                flag: rule.attr("flag").map(str::to_string),
                variables,
                checks,
            });
            contexts.push(format!("({})", context));
        }

        let candidates = if contexts.is_empty() {
            None
        } else {
            Some(self.xpath(&contexts.join(" | "))?)
        };

        Ok(Pattern {
            id: pattern.attr("id").map(str::to_string),
            variables: self.variables(pattern)?,
            rules,
            candidates,
        })
    }

    /// Checks of a rule in source order, expanding `extends` in place
    fn rule_body(
        &self,
        rule: &'a Element,
        checks: &mut Vec<Check>,
        variables: &mut Vec<Variable>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_EXTENDS_DEPTH {
            return Err(self.error("rule extension chain is too deep or circular"));
        }
        for child in rule.elements() {
            if child.namespace.as_deref() != Some(self.namespace) {
                continue;
            }
            match child.local.as_str() {
                "assert" => checks.push(self.check(child, ReportKind::FailedAssertion)?),
                "report" => checks.push(self.check(child, ReportKind::SuccessfulReport)?),
                "extends" => {
                    let id = self.required(child, "rule")?;
                    let base = self
                        .abstract_rules
                        .get(id)
                        .copied()
                        .ok_or_else(|| self.error(format!("extends unknown abstract rule '{}'", id)))?;
                    variables.extend(self.variables(base)?);
                    self.rule_body(base, checks, variables, depth + 1)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check(&self, element: &'a Element, kind: ReportKind) -> Result<Check> {
        let mut message = Vec::new();
        self.message_parts(element, &mut message)?;
        Ok(Check {
            kind,
            test: self.xpath(self.required(element, "test")?)?,
            role: element.attr("role").map(str::to_string),
            id: element.attr("id").map(str::to_string),
            flag: element.attr("flag").map(str::to_string),
            message,
        })
    }

    fn message_parts(&self, element: &Element, parts: &mut Vec<MessagePart>) -> Result<()> {
        for node in &element.children {
            match node {
                Node::Text(text) => parts.push(MessagePart::Text(text.clone())),
                Node::Element(child) if child.is(self.namespace, "value-of") => {
                    let select = self.required(child, "select")?;
                    parts.push(MessagePart::Value(self.xpath(select)?));
                }
                Node::Element(child) if child.is(self.namespace, "name") => {
                    let expression = match child.attr("path") {
                        Some(path) => format!("name({})", path),
                        None => "name()".to_string(),
                    };
                    parts.push(MessagePart::Value(self.xpath(&expression)?));
                }
                Node::Element(child) => self.message_parts(child, parts)?,
            }
        }
        Ok(())
    }
}
