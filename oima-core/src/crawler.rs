//! Concurrent catalog crawler.
//!
//! Turns the flat `/v2/_catalog` listing into a [`Catalog`] tree. Work fans
//! out one task per repository, one per image and one per tag, each level
//! joined through a [`JoinSet`] before results are merged. The first failing
//! task ends the crawl: returning early drops the remaining `JoinSet`s,
//! which aborts every sibling still in flight.
//!
//! Tasks never share the tree while it is being built. Each returns its
//! own results and the caller assembles the [`Catalog`] after the join.

use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::auth::{ApiVersion, RegistryAuth};
use crate::error::RegistryError;
use crate::http::{self, HttpError, RegistryHttp};
use crate::model::{self, Catalog, Tag};

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Images fetched for one repository: `(catalog path, tags)` pairs.
type RepositoryImages = (String, Vec<(String, Vec<Tag>)>);

struct CrawlContext {
    http: RegistryHttp,
    auth: Arc<RegistryAuth>,
    base_uri: String,
    version: ApiVersion,
}

/// Fetches catalog, tags and digests from one registry.
#[derive(Clone)]
pub struct CatalogCrawler {
    ctx: Arc<CrawlContext>,
}

impl CatalogCrawler {
    pub fn new(
        http: RegistryHttp,
        auth: Arc<RegistryAuth>,
        base_uri: impl Into<String>,
        version: ApiVersion,
    ) -> Self {
        Self {
            ctx: Arc::new(CrawlContext {
                http,
                auth,
                base_uri: base_uri.into().trim_end_matches('/').to_string(),
                version,
            }),
        }
    }

    /// Every image path in the catalog, following pagination.
    pub async fn fetch_catalog(&self) -> Result<Vec<String>, RegistryError> {
        self.ctx.fetch_catalog().await
    }

    /// Tags of one image with their digests, sorted by name.
    pub async fn fetch_tags(&self, image_path: &str) -> Result<Vec<Tag>, RegistryError> {
        Arc::clone(&self.ctx).fetch_tags(image_path.to_string()).await
    }

    /// Resolve one tag to its manifest digest.
    pub async fn fetch_digest(&self, image_path: &str, tag: &str) -> Result<String, RegistryError> {
        self.ctx.fetch_digest(image_path, tag).await
    }

    /// Build a complete snapshot: catalog, images, tags and digests.
    pub async fn crawl(&self) -> Result<Catalog, RegistryError> {
        let entries = self.fetch_catalog().await?;
        tracing::info!(
            "Catalog of {} lists {} images",
            self.ctx.base_uri,
            entries.len()
        );

        if let Some(bad) = entries.iter().find(|e| !model::is_valid_path(e)) {
            return Err(RegistryError::MalformedBody {
                url: self.ctx.catalog_url(),
                message: format!("catalog entry '{}' has an empty path segment", bad),
            });
        }

        let entries = Arc::new(entries);
        let mut tasks = JoinSet::new();
        for repository in model::discover_repositories(entries.as_slice()) {
            let ctx = Arc::clone(&self.ctx);
            let entries = Arc::clone(&entries);
            tasks.spawn(async move { ctx.fetch_repository(repository, entries).await });
        }

        let mut fetched = Vec::new();
        while let Some(result) = tasks.join_next().await {
            fetched.push(result??);
        }

        let catalog = assemble(fetched);
        let stats = catalog.stats();
        tracing::info!(
            "Fetched {} repositories, {} images, {} tags",
            stats.repositories,
            stats.images,
            stats.tags
        );
        Ok(catalog)
    }
}

impl std::fmt::Debug for CatalogCrawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogCrawler")
            .field("base_uri", &self.ctx.base_uri)
            .field("version", &self.ctx.version)
            .finish_non_exhaustive()
    }
}

/// Build the arena from joined task results, in name order.
fn assemble(mut fetched: Vec<RepositoryImages>) -> Catalog {
    fetched.sort_by(|a, b| a.0.cmp(&b.0));

    let mut catalog = Catalog::new();
    for (repository, images) in fetched {
        let repository = catalog.insert_repository(&repository);
        for (path, tags) in images {
            let image = catalog.insert_image(repository, &path);
            catalog.image_mut(image).set_tags(tags);
        }
    }
    catalog
}

impl CrawlContext {
    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_uri, self.version, path)
    }

    fn catalog_url(&self) -> String {
        self.url("_catalog")
    }

    /// Send an authorized registry request.
    ///
    /// The token is checked (and renewed if expired) before every request.
    async fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&'static str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let authorization = self.auth.authorization(&self.http).await?;

        let response = self
            .http
            .send(url, |client| {
                let mut request = client
                    .request(method.clone(), url)
                    .header("Docker-Distribution-Api-Version", http::DISTRIBUTION_API_VERSION);
                if let Some(value) = &authorization {
                    request = request.header(AUTHORIZATION, value.clone());
                }
                if let Some(accept) = accept {
                    request = request.header(ACCEPT, accept);
                }
                request
            })
            .await?;

        Ok(http::expect_success(url, response)?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, Option<String>), RegistryError> {
        let response = self.request(Method::GET, url, None).await?;
        let next = http::next_page(response.headers(), &self.base_uri);
        // The next request carries the registry token.
        if let Some(next) = next.as_deref().filter(|n| !http::same_origin(n, &self.base_uri)) {
            return Err(RegistryError::MalformedBody {
                url: url.to_string(),
                message: format!("next page {} is not on {}", next, self.base_uri),
            });
        }

        let body = response.bytes().await.map_err(|e| HttpError::Network {
            url: url.to_string(),
            message: e.to_string(),
            transient: e.is_timeout(),
        })?;
        let value = serde_json::from_slice(&body).map_err(|e| RegistryError::MalformedBody {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        Ok((value, next))
    }

    async fn fetch_catalog(&self) -> Result<Vec<String>, RegistryError> {
        self.fetch_pages(self.catalog_url(), |page: CatalogResponse| page.repositories)
            .await
    }

    /// Follow `rel="next"` links from `first`, collecting the names of every
    /// page. A link back to a page already fetched is a malformed response.
    async fn fetch_pages<T, F>(&self, first: String, take: F) -> Result<Vec<String>, RegistryError>
    where
        T: DeserializeOwned,
        F: Fn(T) -> Option<Vec<String>>,
    {
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut url = Some(first);

        while let Some(current) = url {
            if !visited.insert(current.clone()) {
                return Err(RegistryError::MalformedBody {
                    url: current,
                    message: "pagination links back to a page already fetched".to_string(),
                });
            }
            tracing::debug!("GET {}", current);
            let (page, next) = self.get_json::<T>(&current).await?;
            names.extend(take(page).unwrap_or_default());
            url = next;
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn fetch_repository(
        self: Arc<Self>,
        repository: String,
        entries: Arc<Vec<String>>,
    ) -> Result<RepositoryImages, RegistryError> {
        let mut tasks = JoinSet::new();
        for entry in entries.iter().filter(|e| model::belongs_to(e, &repository)) {
            let ctx = Arc::clone(&self);
            let path = entry.clone();
            tasks.spawn(async move {
                let tags = Arc::clone(&ctx).fetch_tags(path.clone()).await?;
                Ok::<_, RegistryError>((path, tags))
            });
        }

        let mut images = Vec::new();
        while let Some(result) = tasks.join_next().await {
            images.push(result??);
        }
        images.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::debug!("Repository {} holds {} images", repository, images.len());
        Ok((repository, images))
    }

    async fn fetch_tag_names(&self, image_path: &str) -> Result<Vec<String>, RegistryError> {
        let first = self.url(&format!("{}/tags/list", image_path));
        self.fetch_pages(first, |page: TagListResponse| page.tags).await
    }

    async fn fetch_tags(self: Arc<Self>, image_path: String) -> Result<Vec<Tag>, RegistryError> {
        if image_path.is_empty() {
            return Err(RegistryError::internal("cannot fetch tags of an image without a name"));
        }

        let names = self.fetch_tag_names(&image_path).await?;

        let mut tasks = JoinSet::new();
        for name in names {
            let ctx = Arc::clone(&self);
            let path = image_path.clone();
            tasks.spawn(async move {
                let digest = ctx.fetch_digest(&path, &name).await?;
                Ok::<_, RegistryError>(Tag::new(name, digest))
            });
        }

        let mut tags = Vec::new();
        while let Some(result) = tasks.join_next().await {
            tags.push(result??);
        }
        model::normalize_tags(&mut tags);

        tracing::debug!("Image {} has {} tags", image_path, tags.len());
        Ok(tags)
    }

    /// `HEAD` the manifest and read `Docker-Content-Digest`; the body is
    /// never downloaded.
    async fn fetch_digest(&self, image_path: &str, tag: &str) -> Result<String, RegistryError> {
        let url = self.url(&format!("{}/manifests/{}", image_path, tag));
        let response = self
            .request(Method::HEAD, &url, Some(http::MANIFEST_V2_MEDIA_TYPE))
            .await?;

        let digest = response
            .headers()
            .get(http::CONTENT_DIGEST_HEADER)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RegistryError::MissingHeader {
                url: url.clone(),
                header: http::CONTENT_DIGEST_HEADER.to_string(),
            })?;

        Ok(digest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(paths: &[&str]) -> Vec<(String, Vec<Tag>)> {
        paths
            .iter()
            .map(|p| (p.to_string(), vec![Tag::new("latest", "sha256:0")]))
            .collect()
    }

    #[test]
    fn test_assemble_orders_repositories() {
        let fetched = vec![
            ("team/".to_string(), images(&["team/app"])),
            ("/".to_string(), images(&["nginx", "alpine"])),
        ];

        let catalog = assemble(fetched);
        let names: Vec<_> = catalog.repositories().map(|r| r.name()).collect();
        assert_eq!(names, vec!["/", "team/"]);

        let root = catalog.find_repository("/").unwrap();
        let images: Vec<_> = catalog.images_of(root).map(|i| i.name()).collect();
        assert_eq!(images, vec!["alpine", "nginx"]);
        assert!(catalog.find_image("team/app").unwrap().tags_fetched());
    }

    #[test]
    fn test_tag_list_tolerates_null() {
        let body: TagListResponse =
            serde_json::from_str(r#"{"name": "nginx", "tags": null}"#).unwrap();
        assert!(body.tags.is_none());

        let body: CatalogResponse = serde_json::from_str("{}").unwrap();
        assert!(body.repositories.is_none());
    }
}
