use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use tracing::warn;

use crate::error::{Result, ValidationError};

/// Finds schema and rule files under a directory
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    /// File extensions to include (e.g., ["xsd"])
    extensions: Vec<String>,
    /// Glob patterns to skip
    exclude_patterns: Vec<String>,
    /// Maximum depth for directory traversal (None = unlimited)
    max_depth: Option<usize>,
}

impl FileDiscovery {
    pub fn new() -> Self {
        Self {
            extensions: vec!["xsd".to_string()],
            exclude_patterns: Vec::new(),
            max_depth: None,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Discover matching files, sorted by path so source order is stable.
    ///
    /// A single file is returned as-is when its extension matches.
    pub fn discover_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() {
            return Ok(if self.has_wanted_extension(path) {
                vec![path.to_path_buf()]
            } else {
                Vec::new()
            });
        }

        let mut overrides = OverrideBuilder::new(path);
        for pattern in &self.exclude_patterns {
            overrides.add(&format!("!{}", pattern)).map_err(|e| {
                ValidationError::Config(format!("Invalid glob pattern '{}': {}", pattern, e))
            })?;
        }
        let overrides = overrides.build().map_err(|e| {
            ValidationError::Config(format!("Failed to build exclude patterns: {}", e))
        })?;

        let walker = WalkBuilder::new(path)
            .standard_filters(false)
            .max_depth(self.max_depth)
            .overrides(overrides)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    let is_file = entry.file_type().is_some_and(|t| t.is_file());
                    if is_file && self.has_wanted_extension(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Err(e) => warn!(root = %path.display(), error = %e, "skipping unreadable entry"),
            }
        }

        files.sort();
        Ok(files)
    }

    fn has_wanted_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(ext))
            })
    }
}

impl Default for FileDiscovery {
    fn default() -> Self {
        Self::new()
    }
}
