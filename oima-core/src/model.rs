//! Domain model for a registry snapshot.
//!
//! This module defines:
//! - [`Catalog`] - Arena owning every [`Repository`] and [`Image`] of one snapshot
//! - [`Repository`] - A path prefix such as `team/sub/` grouping images
//! - [`Image`] - One catalog entry, with a back-reference to its repository
//! - [`Tag`] - Tag name, content digest and signature flag
//! - [`Stats`] - Counters computed by walking the tree
//!
//! Repositories and images refer to each other through [`RepositoryId`] and
//! [`ImageId`] indices into the arena, never through owning pointers.
//!
//! The free functions at the bottom classify flat catalog paths into
//! repositories. They are pure and do no I/O.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of the implicit repository holding entries without a `/`.
pub const ROOT_REPOSITORY: &str = "/";

/// Index of a [`Repository`] within its [`Catalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(usize);

/// Index of an [`Image`] within its [`Catalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(usize);

/// One tag of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub name: String,

    /// Manifest digest, e.g. `sha256:9f86d0...`.
    pub content_digest: String,

    /// Set by a signature checker; the crawler leaves it `false`.
    pub signature_found: bool,
}

impl Tag {
    pub fn new(name: impl Into<String>, content_digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_digest: content_digest.into(),
            signature_found: false,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Sort tags by name and drop later duplicates.
pub fn normalize_tags(tags: &mut Vec<Tag>) {
    tags.sort_by(|a, b| a.name.cmp(&b.name));
    tags.dedup_by(|a, b| a.name == b.name);
}

/// A container image: one entry of the registry catalog.
#[derive(Debug, Clone)]
pub struct Image {
    name: String,
    path: String,
    repository: RepositoryId,
    tags: Vec<Tag>,
    tags_fetched: bool,
}

impl Image {
    /// Leaf name, i.e. the catalog path minus the repository prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full catalog path, e.g. `team/sub/app`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The repository owning this image.
    pub fn repository(&self) -> RepositoryId {
        self.repository
    }

    /// Tags in name order. Empty until fetched.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name == name)
    }

    /// Whether the tag list has been fetched, even if it turned out empty.
    pub fn tags_fetched(&self) -> bool {
        self.tags_fetched
    }

    /// Replace the tags, keeping them sorted and unique by name.
    pub fn set_tags(&mut self, mut tags: Vec<Tag>) {
        normalize_tags(&mut tags);
        self.tags = tags;
        self.tags_fetched = true;
    }

    pub(crate) fn tags_mut(&mut self) -> &mut [Tag] {
        &mut self.tags
    }
}

/// A path prefix grouping images.
#[derive(Debug, Clone)]
pub struct Repository {
    name: String,
    images: Vec<ImageId>,
}

impl Repository {
    /// `/` for the root repository, otherwise a prefix ending in `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image ids in name order.
    pub fn image_ids(&self) -> &[ImageId] {
        &self.images
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_REPOSITORY
    }
}

/// Counters over a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub repositories: usize,
    pub images: usize,
    pub tags: usize,
    pub signatures: usize,
}

/// Arena owning one registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    repositories: Vec<Repository>,
    images: Vec<Image>,
    by_name: BTreeMap<String, RepositoryId>,
    by_path: HashMap<String, ImageId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// Return the id of repository `name`, creating it on first use.
    ///
    /// An empty name maps to the root repository.
    pub fn insert_repository(&mut self, name: &str) -> RepositoryId {
        let name = if name.is_empty() { ROOT_REPOSITORY } else { name };
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }

        let id = RepositoryId(self.repositories.len());
        self.repositories.push(Repository {
            name: name.to_string(),
            images: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Add the image at catalog `path` to `repository`.
    ///
    /// Re-inserting a known path returns the existing id.
    pub fn insert_image(&mut self, repository: RepositoryId, path: &str) -> ImageId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }

        let id = ImageId(self.images.len());
        let name = image_leaf(path).to_string();
        self.images.push(Image {
            name,
            path: path.to_string(),
            repository,
            tags: Vec::new(),
            tags_fetched: false,
        });
        self.by_path.insert(path.to_string(), id);

        let images = &self.images;
        let ids = &mut self.repositories[repository.0].images;
        let at = ids.partition_point(|other| images[other.0].name < images[id.0].name);
        ids.insert(at, id);
        id
    }

    pub fn repository(&self, id: RepositoryId) -> &Repository {
        &self.repositories[id.0]
    }

    pub fn image(&self, id: ImageId) -> &Image {
        &self.images[id.0]
    }

    pub fn image_mut(&mut self, id: ImageId) -> &mut Image {
        &mut self.images[id.0]
    }

    /// Repositories in name order.
    pub fn repositories(&self) -> impl Iterator<Item = &Repository> {
        self.by_name.values().map(|id| &self.repositories[id.0])
    }

    pub fn find_repository(&self, name: &str) -> Option<&Repository> {
        self.by_name.get(name).map(|id| &self.repositories[id.0])
    }

    /// Images of `repository` in name order.
    pub fn images_of<'a>(&'a self, repository: &'a Repository) -> impl Iterator<Item = &'a Image> {
        repository.images.iter().map(|id| &self.images[id.0])
    }

    /// All image ids, in insertion order.
    pub fn image_ids(&self) -> impl Iterator<Item = ImageId> + use<> {
        (0..self.images.len()).map(ImageId)
    }

    pub fn find_image_id(&self, path: &str) -> Option<ImageId> {
        self.by_path.get(path).copied()
    }

    pub fn find_image(&self, path: &str) -> Option<&Image> {
        self.find_image_id(path).map(|id| &self.images[id.0])
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            repositories: self.repositories.len(),
            images: self.images.len(),
            ..Stats::default()
        };
        for image in &self.images {
            stats.tags += image.tags.len();
            stats.signatures += image.tags.iter().filter(|t| t.signature_found).count();
        }
        stats
    }
}

/// Repository name of a catalog entry: everything up to and including the
/// last `/`, or [`ROOT_REPOSITORY`] when there is none.
pub fn repository_of(entry: &str) -> String {
    match entry.rsplit_once('/') {
        Some((prefix, _)) if !prefix.is_empty() => format!("{}/", prefix),
        _ => ROOT_REPOSITORY.to_string(),
    }
}

/// Whether a catalog entry is a usable image path: non-empty segments
/// separated by single `/`.
pub fn is_valid_path(entry: &str) -> bool {
    !entry.split('/').any(str::is_empty)
}

/// Final path segment of a catalog entry.
pub fn image_leaf(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Number of path segments in a repository name; the root has depth 0.
pub fn depth(repository: &str) -> usize {
    if repository.is_empty() || repository == ROOT_REPOSITORY {
        0
    } else {
        repository.matches('/').count()
    }
}

/// Whether `entry` is a direct member of `repository`.
///
/// A member has exactly one more path segment than the repository, so
/// `team/sub/app` belongs to `team/sub/` but not to `team/`.
pub fn belongs_to(entry: &str, repository: &str) -> bool {
    if repository.is_empty() || repository == ROOT_REPOSITORY {
        return !entry.contains('/');
    }
    entry.starts_with(repository) && entry.matches('/').count() == depth(repository)
}

/// Distinct repository names of a catalog listing, in name order.
pub fn discover_repositories<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut names: Vec<String> = entries.iter().map(|e| repository_of(e.as_ref())).collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_of() {
        assert_eq!(repository_of("nginx"), "/");
        assert_eq!(repository_of("team/app"), "team/");
        assert_eq!(repository_of("team/sub/app2"), "team/sub/");
    }

    #[test]
    fn test_repository_is_entry_without_last_segment() {
        for entry in ["a", "a/b", "a/b/c", "x/y/z/w", "library/nginx"] {
            let repo = repository_of(entry);
            let leaf = image_leaf(entry);
            if entry.contains('/') {
                assert_eq!(format!("{}{}", repo, leaf), entry);
            } else {
                assert_eq!(repo, ROOT_REPOSITORY);
                assert_eq!(leaf, entry);
            }
        }
    }

    #[test]
    fn test_is_valid_path() {
        assert!(is_valid_path("nginx"));
        assert!(is_valid_path("team/sub/app2"));
        for bad in ["", "/nginx", "team/", "team//app", "/"] {
            assert!(!is_valid_path(bad), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth(""), 0);
        assert_eq!(depth("team/"), 1);
        assert_eq!(depth("team/sub/"), 2);
    }

    #[test]
    fn test_belongs_to() {
        assert!(belongs_to("nginx", "/"));
        assert!(!belongs_to("team/app", "/"));
        assert!(belongs_to("team/app", "team/"));
        assert!(!belongs_to("team/sub/app2", "team/"));
        assert!(belongs_to("team/sub/app2", "team/sub/"));
        assert!(!belongs_to("teammate/app", "team/"));
    }

    #[test]
    fn test_discover_repositories_dedups() {
        let entries = ["nginx", "team/app", "team/other", "team/sub/app2", "redis"];
        assert_eq!(
            discover_repositories(&entries),
            vec!["/".to_string(), "team/".to_string(), "team/sub/".to_string()]
        );
    }

    #[test]
    fn test_insert_repository_is_idempotent() {
        let mut catalog = Catalog::new();
        let a = catalog.insert_repository("team/");
        let b = catalog.insert_repository("team/");
        let root = catalog.insert_repository("");

        assert_eq!(a, b);
        assert_eq!(catalog.repository(root).name(), "/");
        assert_eq!(catalog.repositories().count(), 2);
    }

    #[test]
    fn test_images_sorted_with_back_reference() {
        let mut catalog = Catalog::new();
        let team = catalog.insert_repository("team/");
        catalog.insert_image(team, "team/zeta");
        catalog.insert_image(team, "team/alpha");
        catalog.insert_image(team, "team/alpha");

        let repo = catalog.repository(team);
        let names: Vec<_> = catalog.images_of(repo).map(Image::name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let image = catalog.find_image("team/zeta").unwrap();
        assert_eq!(image.repository(), team);
        assert_eq!(image.path(), "team/zeta");
        assert!(!image.tags_fetched());
    }

    #[test]
    fn test_repositories_iterate_in_name_order() {
        let mut catalog = Catalog::new();
        catalog.insert_repository("zoo/");
        catalog.insert_repository("/");
        catalog.insert_repository("app/");

        let names: Vec<_> = catalog.repositories().map(Repository::name).collect();
        assert_eq!(names, vec!["/", "app/", "zoo/"]);
    }

    #[test]
    fn test_set_tags_sorts_and_dedups() {
        let mut catalog = Catalog::new();
        let root = catalog.insert_repository("/");
        let id = catalog.insert_image(root, "nginx");

        catalog.image_mut(id).set_tags(vec![
            Tag::new("latest", "sha256:b"),
            Tag::new("1.0", "sha256:a"),
            Tag::new("latest", "sha256:c"),
        ]);

        let image = catalog.image(id);
        let names: Vec<_> = image.tags().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["1.0", "latest"]);
        assert!(image.tags_fetched());
        assert_eq!(image.tag("latest").unwrap().content_digest, "sha256:b");
    }

    #[test]
    fn test_stats_counts_signatures() {
        let mut catalog = Catalog::new();
        assert_eq!(catalog.stats(), Stats::default());

        let root = catalog.insert_repository("/");
        let team = catalog.insert_repository("team/");
        let nginx = catalog.insert_image(root, "nginx");
        let app = catalog.insert_image(team, "team/app");

        catalog.image_mut(nginx).set_tags(vec![Tag::new("latest", "sha256:1")]);
        let mut signed = Tag::new("1.0", "sha256:2");
        signed.signature_found = true;
        catalog
            .image_mut(app)
            .set_tags(vec![signed, Tag::new("1.1", "sha256:3")]);

        assert_eq!(
            catalog.stats(),
            Stats {
                repositories: 2,
                images: 2,
                tags: 3,
                signatures: 1,
            }
        );
    }
}
