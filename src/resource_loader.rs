//! Fetching schema, rule and document sources by location
//!
//! Every location first goes through the catalog resolver. Local paths and
//! `file:` URLs are read directly; `http(s):` URLs go through the two-tier
//! [`ResourceCache`] and the retrying [`HttpClient`].

use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::cache::ResourceCache;
use crate::catalog::CatalogResolver;
use crate::error::{Result, ValidationError};
use crate::http_client::{HttpClient, HttpClientConfig};
use crate::libxml2::EntityResolver;
use crate::location;

/// Bytes of a fetched resource together with the location they came from
#[derive(Debug, Clone)]
pub struct Resource {
    /// Location after catalog resolution, as an absolute URL when possible
    pub location: String,
    pub data: Arc<Vec<u8>>,
}

impl Resource {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

pub struct ResourceLoader {
    resolver: Arc<CatalogResolver>,
    cache: Option<Arc<ResourceCache>>,
    http_config: HttpClientConfig,
    http: OnceLock<HttpClient>,
}

impl ResourceLoader {
    pub fn new(
        resolver: Arc<CatalogResolver>,
        cache: Option<ResourceCache>,
        http_config: HttpClientConfig,
    ) -> Self {
        Self {
            resolver,
            cache: cache.map(Arc::new),
            http_config,
            http: OnceLock::new(),
        }
    }

    /// Same download cache and network settings, different catalogs
    pub fn with_resolver(&self, resolver: Arc<CatalogResolver>) -> Self {
        Self {
            resolver,
            cache: self.cache.clone(),
            http_config: self.http_config.clone(),
            http: OnceLock::new(),
        }
    }

    /// Loader without a disk cache, using default network settings
    pub fn uncached(resolver: Arc<CatalogResolver>) -> Self {
        Self::new(resolver, None, HttpClientConfig::default())
    }

    pub fn resolver(&self) -> &Arc<CatalogResolver> {
        &self.resolver
    }

    /// Apply catalog redirection, then canonicalize to an absolute URL.
    pub fn resolve(&self, location: &str) -> String {
        let redirected = self.resolver.resolve_location(location);
        location::canonical(&redirected)
    }

    pub fn fetch(&self, location: &str) -> Result<Resource> {
        let resolved = self.resolve(location);
        if resolved != location {
            debug!(%location, %resolved, "resolved resource location");
        }

        let data = if location::is_remote(&resolved) {
            self.download_remote(&resolved)?
        } else {
            Arc::new(self.fetch_local(&resolved)?)
        };

        Ok(Resource {
            location: resolved,
            data,
        })
    }

    fn fetch_local(&self, resolved: &str) -> Result<Vec<u8>> {
        let path = location::to_local_path(resolved).ok_or_else(|| {
            ValidationError::ResourceNotFound {
                location: resolved.to_string(),
            }
        })?;

        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ValidationError::ResourceNotFound {
                location: resolved.to_string(),
            },
            _ => ValidationError::Io(e),
        })
    }

    fn download_remote(&self, url: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(cache) = &self.cache
            && let Some(cached) = cache.get(url)?
        {
            return Ok(cached.data.clone());
        }

        let download = self.http_client()?.download(url)?;
        match &self.cache {
            Some(cache) => Ok(cache.store(url, download)?.data.clone()),
            None => Ok(Arc::new(download.data)),
        }
    }

    fn http_client(&self) -> Result<&HttpClient> {
        if let Some(client) = self.http.get() {
            return Ok(client);
        }
        let client = HttpClient::new(self.http_config.clone())?;
        Ok(self.http.get_or_init(|| client))
    }
}

/// Catalog redirection and cached remote reads for loads made inside libxml2
/// (schema imports, XIncludes, external DTDs).
impl EntityResolver for ResourceLoader {
    fn resolve(&self, public_id: Option<&str>, system_id: Option<&str>) -> Option<String> {
        let resolved = self.resolver.resolve_entity(public_id, system_id);
        if let Some(target) = &resolved {
            debug!(?public_id, ?system_id, %target, "catalog redirect");
        }
        resolved
    }

    fn fetch_remote(&self, url: &str) -> Option<Vec<u8>> {
        match self.download_remote(url) {
            Ok(data) => Some(data.as_ref().clone()),
            Err(e) => {
                warn!(%url, error = %e, "remote load failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::http_client::Download;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_local_path_and_file_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.sch");
        std::fs::write(&path, "<schema/>").unwrap();
        let loader = ResourceLoader::uncached(Arc::new(CatalogResolver::empty()));

        let by_path = loader.fetch(&path.to_string_lossy()).unwrap();
        assert_eq!(by_path.text(), "<schema/>");
        assert!(by_path.location.starts_with("file://"));

        let by_url = loader.fetch(&by_path.location).unwrap();
        assert_eq!(by_url.location, by_path.location);
    }

    #[test]
    fn test_missing_file_is_resource_not_found() {
        let dir = TempDir::new().unwrap();
        let loader = ResourceLoader::uncached(Arc::new(CatalogResolver::empty()));

        match loader.fetch(&dir.path().join("nope.sch").to_string_lossy()) {
            Err(ValidationError::ResourceNotFound { location }) => {
                assert!(location.ends_with("nope.sch"))
            }
            other => panic!("Expected ResourceNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_catalog_redirects_remote_to_local() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("local.sch"), "<local/>").unwrap();
        let catalog = dir.path().join("catalog.xml");
        std::fs::write(
            &catalog,
            r#"<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog">
  <uri name="http://pds.nasa.gov/rules.sch" uri="local.sch"/>
</catalog>"#,
        )
        .unwrap();

        let resolver = Arc::new(CatalogResolver::load(&[catalog]).unwrap());
        let loader = ResourceLoader::uncached(resolver);
        let resource = loader.fetch("http://pds.nasa.gov/rules.sch").unwrap();

        assert_eq!(resource.text(), "<local/>");
        assert!(resource.location.ends_with("/local.sch"));
    }

    #[test]
    fn test_entity_resolver_uses_catalog() {
        let dir = TempDir::new().unwrap();
        let catalog = dir.path().join("catalog.xml");
        std::fs::write(
            &catalog,
            r#"<catalog xmlns="urn:oasis:names:tc:entity:xmlns:xml:catalog">
  <system systemId="http://pds.nasa.gov/a.xsd" uri="a.xsd"/>
</catalog>"#,
        )
        .unwrap();
        let loader = ResourceLoader::uncached(Arc::new(CatalogResolver::load(&[catalog]).unwrap()));

        let target = EntityResolver::resolve(&loader, None, Some("http://pds.nasa.gov/a.xsd")).unwrap();
        assert!(target.ends_with("/a.xsd"));
        assert!(target.starts_with("file://"));
        assert!(EntityResolver::resolve(&loader, None, Some("http://other/b.xsd")).is_none());
    }

    #[test]
    fn test_remote_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let cache = ResourceCache::new(CacheConfig {
            directory: dir.path().to_path_buf(),
            ..CacheConfig::default()
        });
        let url = "http://unreachable.invalid/schema.xsd";
        cache
            .store(
                url,
                Download {
                    data: b"<cached/>".to_vec(),
                    etag: None,
                    last_modified: None,
                },
            )
            .unwrap();

        let loader = ResourceLoader::new(
            Arc::new(CatalogResolver::empty()),
            Some(cache),
            HttpClientConfig::default(),
        );
        let resource = loader.fetch(url).unwrap();
        assert_eq!(resource.text(), "<cached/>");

        let rebuilt = loader.with_resolver(Arc::new(CatalogResolver::empty()));
        assert_eq!(rebuilt.fetch(url).unwrap().text(), "<cached/>");
    }
}
