//! Default schemas and rule sources per information model version
//!
//! A [`ModelResources`] provider answers which model versions are supported
//! and which schema and rule locations make up each version's defaults. The
//! stock provider is [`DirectoryResources`], which expects one subdirectory
//! per version:
//!
//! ```text
//! resources/
//!   1.1.0.0/PDS4_PDS_1100.xsd
//!   1.1.0.0/PDS4_PDS_1100.sch
//!   1.2.0.0/...
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::file_discovery::FileDiscovery;
use crate::location;

/// Source of the bundled defaults used when nothing more specific is configured
pub trait ModelResources: Send + Sync {
    /// Versions in ascending order
    fn supported_versions(&self) -> Vec<String>;

    /// Version used when none is set; the newest supported one.
    fn default_version(&self) -> Option<String> {
        self.supported_versions().pop()
    }

    /// Schema locations for a version, in compilation order
    fn schemas(&self, version: &str) -> Result<Vec<String>>;

    /// Rule source locations for a version, in evaluation order
    fn rules(&self, version: &str) -> Result<Vec<String>>;
}

/// Compare dotted version strings numerically, falling back to text order
/// for non-numeric components.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Reads `<root>/<version>/*.xsd` and `<root>/<version>/*.sch`
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locations(&self, version: &str, extension: &str) -> Result<Vec<String>> {
        let dir = self.root.join(version);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let files = FileDiscovery::new()
            .with_extensions(vec![extension.to_string()])
            .with_max_depth(Some(1))
            .discover_files(&dir)?;
        debug!(%version, extension, count = files.len(), "bundled resources");
        Ok(files
            .iter()
            .map(|path| location::canonical(&path.to_string_lossy()))
            .collect())
    }
}

impl ModelResources for DirectoryResources {
    fn supported_versions(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        versions
    }

    fn schemas(&self, version: &str) -> Result<Vec<String>> {
        self.locations(version, "xsd")
    }

    fn rules(&self, version: &str) -> Result<Vec<String>> {
        self.locations(version, "sch")
    }
}

/// In-memory table of versions, handy for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticResources {
    versions: BTreeMap<String, (Vec<String>, Vec<String>)>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(
        mut self,
        version: impl Into<String>,
        schemas: Vec<String>,
        rules: Vec<String>,
    ) -> Self {
        self.versions.insert(version.into(), (schemas, rules));
        self
    }
}

impl ModelResources for StaticResources {
    fn supported_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.versions.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        versions
    }

    fn schemas(&self, version: &str) -> Result<Vec<String>> {
        Ok(self
            .versions
            .get(version)
            .map(|(schemas, _)| schemas.clone())
            .unwrap_or_default())
    }

    fn rules(&self, version: &str) -> Result<Vec<String>> {
        Ok(self
            .versions
            .get(version)
            .map(|(_, rules)| rules.clone())
            .unwrap_or_default())
    }
}

/// Schemas and rule sources found in a flat directory (`schema_directory`)
pub fn directory_sources(dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let discover = |extension: &str| -> Result<Vec<String>> {
        Ok(FileDiscovery::new()
            .with_extensions(vec![extension.to_string()])
            .discover_files(dir)?
            .iter()
            .map(|path| location::canonical(&path.to_string_lossy()))
            .collect())
    };
    Ok((discover("xsd")?, discover("sch")?))
}
