//! Identifier resolution through OASIS XML catalogs
//!
//! A [`CatalogResolver`] is configured once with an ordered list of catalog
//! files. Public identifier matches win over system identifier matches; with
//! no catalogs configured every lookup misses and callers keep the requested
//! location.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ValidationError};
use crate::location;
use crate::markup::{self, Element, normalize_space};

pub const CATALOG_NAMESPACE: &str = "urn:oasis:names:tc:entity:xmlns:xml:catalog";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Public { public_id: String, uri: String },
    System { system_id: String, uri: String },
    RewriteSystem { prefix: String, rewrite: String },
    SystemSuffix { suffix: String, uri: String },
    Uri { name: String, uri: String },
    RewriteUri { prefix: String, rewrite: String },
    UriSuffix { suffix: String, uri: String },
}

#[derive(Debug, Clone)]
struct Catalog {
    location: String,
    entries: Vec<Entry>,
}

/// Ordered set of catalogs consulted for public, system and URI lookups
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    catalogs: Vec<Catalog>,
}

impl CatalogResolver {
    /// Resolver with no catalogs; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load catalogs in order. `nextCatalog` entries are appended after the
    /// catalog that declares them.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut catalogs = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            load_catalog(path.as_ref(), &mut catalogs, &mut seen, true)?;
        }
        debug!(count = catalogs.len(), "loaded catalogs");
        Ok(Self { catalogs })
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Catalog files in consultation order
    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.catalogs.iter().map(|c| c.location.as_str())
    }

    /// Resolve an external identifier. Public identifiers are tried across
    /// all catalogs before system identifiers.
    pub fn resolve_entity(&self, public_id: Option<&str>, system_id: Option<&str>) -> Option<String> {
        if let Some(public_id) = public_id.map(normalize_space).filter(|p| !p.is_empty()) {
            for catalog in &self.catalogs {
                for entry in &catalog.entries {
                    if let Entry::Public { public_id: id, uri } = entry
                        && *id == public_id
                    {
                        return Some(uri.clone());
                    }
                }
            }
        }

        let system_id = system_id?;
        self.catalogs
            .iter()
            .find_map(|catalog| resolve_system(catalog, system_id))
    }

    /// Resolve a URI reference (rule sources, schema locations); falls back to
    /// system entries so one catalog can serve both.
    pub fn resolve_uri(&self, uri: &str) -> Option<String> {
        self.catalogs
            .iter()
            .find_map(|catalog| resolve_uri_in(catalog, uri))
            .or_else(|| self.resolve_entity(None, Some(uri)))
    }

    /// `resolve_uri`, or the location itself on a miss
    pub fn resolve_location(&self, location: &str) -> String {
        self.resolve_uri(location)
            .unwrap_or_else(|| location.to_string())
    }
}

fn resolve_system(catalog: &Catalog, system_id: &str) -> Option<String> {
    let mut rewrite: Option<(&str, &str)> = None;
    let mut suffix: Option<(&str, &str)> = None;
    for entry in &catalog.entries {
        match entry {
            Entry::System { system_id: id, uri } if id == system_id => return Some(uri.clone()),
            Entry::RewriteSystem { prefix, rewrite: to }
                if system_id.starts_with(prefix.as_str())
                    && rewrite.is_none_or(|(p, _)| prefix.len() > p.len()) =>
            {
                rewrite = Some((prefix.as_str(), to.as_str()));
            }
            Entry::SystemSuffix { suffix: s, uri }
                if system_id.ends_with(s.as_str())
                    && suffix.is_none_or(|(p, _)| s.len() > p.len()) =>
            {
                suffix = Some((s.as_str(), uri.as_str()));
            }
            _ => {}
        }
    }
    rewrite
        .map(|(prefix, to)| format!("{}{}", to, &system_id[prefix.len()..]))
        .or_else(|| suffix.map(|(_, uri)| uri.to_string()))
}

fn resolve_uri_in(catalog: &Catalog, uri: &str) -> Option<String> {
    let mut rewrite: Option<(&str, &str)> = None;
    let mut suffix: Option<(&str, &str)> = None;
    for entry in &catalog.entries {
        match entry {
            Entry::Uri { name, uri: target } if name == uri => return Some(target.clone()),
            Entry::RewriteUri { prefix, rewrite: to }
                if uri.starts_with(prefix.as_str())
                    && rewrite.is_none_or(|(p, _)| prefix.len() > p.len()) =>
            {
                rewrite = Some((prefix.as_str(), to.as_str()));
            }
            Entry::UriSuffix { suffix: s, uri: target }
                if uri.ends_with(s.as_str()) && suffix.is_none_or(|(p, _)| s.len() > p.len()) =>
            {
                suffix = Some((s.as_str(), target.as_str()));
            }
            _ => {}
        }
    }
    rewrite
        .map(|(prefix, to)| format!("{}{}", to, &uri[prefix.len()..]))
        .or_else(|| suffix.map(|(_, target)| target.to_string()))
}

fn catalog_error(path: &Path, details: impl Into<String>) -> ValidationError {
    ValidationError::Catalog {
        path: path.to_path_buf(),
        details: details.into(),
    }
}

fn load_catalog(
    path: &Path,
    catalogs: &mut Vec<Catalog>,
    seen: &mut HashSet<PathBuf>,
    required: bool,
) -> Result<()> {
    let absolute = std::path::absolute(path).map_err(|e| catalog_error(path, e.to_string()))?;
    if !seen.insert(absolute.clone()) {
        return Ok(());
    }

    let content = match std::fs::read_to_string(&absolute) {
        Ok(content) => content,
        Err(e) if !required => {
            warn!(path = %absolute.display(), error = %e, "skipping unreadable nextCatalog");
            return Ok(());
        }
        Err(e) => return Err(catalog_error(&absolute, e.to_string())),
    };

    let root = markup::parse(&content).map_err(|e| catalog_error(&absolute, e.to_string()))?;
    if !is_catalog_element(&root, "catalog") {
        return Err(catalog_error(
            &absolute,
            format!("root element is <{}>, expected <catalog>", root.local),
        ));
    }

    let location = location::canonical(&absolute.to_string_lossy());
    let base = root.xml_base().and_then(|b| location::resolve(Some(&location), b));
    let mut entries = Vec::new();
    let mut next = Vec::new();
    collect_entries(
        &root,
        base.as_deref().unwrap_or(&location),
        &mut entries,
        &mut next,
    );

    catalogs.push(Catalog { location, entries });

    for next_location in next {
        match location::to_local_path(&next_location) {
            Some(next_path) => load_catalog(&next_path, catalogs, seen, false)?,
            None => warn!(catalog = %next_location, "ignoring non-local nextCatalog"),
        }
    }
    Ok(())
}

fn is_catalog_element(element: &Element, local: &str) -> bool {
    element.local == local
        && matches!(element.namespace.as_deref(), None | Some(CATALOG_NAMESPACE))
}

fn collect_entries(element: &Element, base: &str, entries: &mut Vec<Entry>, next: &mut Vec<String>) {
    let absolute = |value: &str| location::resolve(Some(base), value).unwrap_or_else(|| value.to_string());

    for child in element.elements() {
        if child.namespace.as_deref().is_some_and(|ns| ns != CATALOG_NAMESPACE) {
            continue;
        }
        let entry = match child.local.as_str() {
            "public" => child.attr("publicId").zip(child.attr("uri")).map(|(id, uri)| Entry::Public {
                public_id: normalize_space(id),
                uri: absolute(uri),
            }),
            "system" => child.attr("systemId").zip(child.attr("uri")).map(|(id, uri)| Entry::System {
                system_id: id.to_string(),
                uri: absolute(uri),
            }),
            "rewriteSystem" => child
                .attr("systemIdStartString")
                .zip(child.attr("rewritePrefix"))
                .map(|(prefix, to)| Entry::RewriteSystem {
                    prefix: prefix.to_string(),
                    rewrite: absolute(to),
                }),
            "systemSuffix" => child
                .attr("systemIdSuffix")
                .zip(child.attr("uri"))
                .map(|(suffix, uri)| Entry::SystemSuffix {
                    suffix: suffix.to_string(),
                    uri: absolute(uri),
                }),
            "uri" => child.attr("name").zip(child.attr("uri")).map(|(name, uri)| Entry::Uri {
                name: name.to_string(),
                uri: absolute(uri),
            }),
            "rewriteURI" => child
                .attr("uriStartString")
                .zip(child.attr("rewritePrefix"))
                .map(|(prefix, to)| Entry::RewriteUri {
                    prefix: prefix.to_string(),
                    rewrite: absolute(to),
                }),
            "uriSuffix" => child
                .attr("uriSuffix")
                .zip(child.attr("uri"))
                .map(|(suffix, uri)| Entry::UriSuffix {
                    suffix: suffix.to_string(),
                    uri: absolute(uri),
                }),
            "nextCatalog" => {
                if let Some(catalog) = child.attr("catalog") {
                    next.push(absolute(catalog));
                }
                None
            }
            "group" => {
                let group_base = child
                    .xml_base()
                    .map(|b| absolute(b))
                    .unwrap_or_else(|| base.to_string());
                collect_entries(child, &group_base, entries, next);
                None
            }
            _ => None,
        };
        if let Some(entry) = entry {
            entries.push(entry);
        }
    }
}
