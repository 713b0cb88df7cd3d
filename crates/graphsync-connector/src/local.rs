//! Local directory lister
//!
//! Exposes a directory tree on the local filesystem as a container, the way
//! an object store exposes a bucket. External ids are paths relative to the
//! container root, so a rename or move shows up as a new id with the same
//! content hash, the case the classifier's fingerprint lookup exists for.
//!
//! ## Entry mapping
//!
//! | Field          | Source                                       |
//! |----------------|----------------------------------------------|
//! | `id`           | relative path with `/` separators            |
//! | `parent_id`    | relative path of the parent, none at root    |
//! | `path`         | `/` + relative path                          |
//! | `content_hash` | SHA-256 of the file contents (files only)    |
//! | `modified_at`  | mtime in epoch milliseconds                  |
//! | `owner`        | the OS user running the daemon               |
//!
//! Children are listed in name order and paginated by offset.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use graphsync_core::domain::{
    ConnectorName, ContainerInfo, ContainerRef, ExternalId, Principal, RawObjectEntry,
    RawPrincipal, RawTimestamp,
};
use graphsync_core::ports::{IObjectLister, ListingPage, ProviderError};

/// Connector name the daemon registers this lister under
pub const LOCAL_CONNECTOR: &str = "local";

/// Default number of children per page
const DEFAULT_PAGE_SIZE: usize = 200;

/// Lists local directory trees as containers
#[derive(Debug, Clone)]
pub struct LocalDirectoryLister {
    name: ConnectorName,
    roots: HashMap<ContainerRef, PathBuf>,
    page_size: usize,
    user: Principal,
}

impl LocalDirectoryLister {
    /// Creates a lister with no containers registered
    pub fn new(name: ConnectorName) -> Self {
        let user = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| LOCAL_CONNECTOR.to_string());
        Self {
            name,
            roots: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            user: Principal::new(user, None),
        }
    }

    /// Registers the directory backing a container
    pub fn with_root(mut self, container: ContainerRef, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(container, root.into());
        self
    }

    /// Sets the page size (minimum 1)
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Overrides the identity reported as owner and by `whoami`
    pub fn with_user(mut self, user: Principal) -> Self {
        self.user = user;
        self
    }

    fn root(&self, container: &ContainerRef) -> Result<&PathBuf> {
        self.roots.get(container).ok_or_else(|| {
            ProviderError::Configuration(format!("No local root registered for {container}"))
                .into()
        })
    }

    /// Resolves a relative external id below the root, refusing escapes
    fn resolve(root: &Path, relative: &ExternalId) -> Result<PathBuf> {
        let rel = Path::new(relative.as_str());
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(ProviderError::Permanent(format!(
                "Refusing to list outside the container root: {relative}"
            ))
            .into());
        }
        Ok(root.join(rel))
    }

    fn owner(&self) -> RawPrincipal {
        RawPrincipal {
            id: Some(self.user.id.clone()),
            email: self.user.email.clone(),
        }
    }

    async fn to_entry(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&ExternalId>,
        is_dir: bool,
        metadata: &std::fs::Metadata,
    ) -> Result<RawObjectEntry> {
        let relative = match parent {
            Some(p) => format!("{}/{}", p.as_str(), name),
            None => name.to_string(),
        };

        let mut entry = if is_dir {
            RawObjectEntry::folder(relative.clone(), name)
        } else {
            let mut file = RawObjectEntry::file(relative.clone(), name);
            file.size = Some(metadata.len());
            file.content_hash = Some(hash_file(path.to_path_buf()).await?);
            file.mime_type = mime_for(name).map(str::to_string);
            file
        };

        entry.parent_id = parent.map(|p| p.to_string());
        entry.path = Some(format!("/{relative}"));
        entry.modified_at = metadata.modified().ok().map(epoch_millis);
        entry.created_at = metadata.created().ok().map(epoch_millis);
        entry.owner = Some(self.owner());
        Ok(entry)
    }
}

fn epoch_millis(time: SystemTime) -> RawTimestamp {
    RawTimestamp::EpochMillis(DateTime::<Utc>::from(time).timestamp_millis())
}

/// Streams a file through SHA-256 on the blocking pool
async fn hash_file(path: PathBuf) -> Result<String> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .context("Hashing task failed")?
    .with_context(|| format!("Failed to hash {display}"))
}

fn mime_for(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    })
}

fn map_io_error(err: io::Error, dir: &Path) -> anyhow::Error {
    match err.kind() {
        io::ErrorKind::NotFound => ProviderError::NotFound(dir.display().to_string()).into(),
        io::ErrorKind::PermissionDenied => {
            ProviderError::AccessDenied(dir.display().to_string()).into()
        }
        _ => anyhow::Error::new(err).context(format!("Failed to read {}", dir.display())),
    }
}

#[async_trait::async_trait]
impl IObjectLister for LocalDirectoryLister {
    fn connector_name(&self) -> &ConnectorName {
        &self.name
    }

    async fn list_children(
        &self,
        container: &ContainerRef,
        parent: Option<&ExternalId>,
        page_token: Option<&str>,
    ) -> Result<ListingPage> {
        let root = self.root(container)?;
        let dir = match parent {
            Some(p) => Self::resolve(root, p)?,
            None => root.clone(),
        };

        let offset = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                ProviderError::Permanent(format!("Invalid page token: {token}"))
            })?,
            None => 0,
        };

        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| map_io_error(e, &dir))?;

        let mut children = Vec::new();
        while let Some(child) = read_dir
            .next_entry()
            .await
            .map_err(|e| map_io_error(e, &dir))?
        {
            let Ok(name) = child.file_name().into_string() else {
                warn!(dir = %dir.display(), "Skipping entry with a non UTF-8 name");
                continue;
            };
            children.push((name, child.path()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let total = children.len();
        let mut entries = Vec::new();
        for (name, path) in children.into_iter().skip(offset).take(self.page_size) {
            // Symlinks are not followed
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Entry vanished while listing");
                    continue;
                }
            };
            if metadata.file_type().is_symlink() {
                debug!(path = %path.display(), "Skipping symlink");
                continue;
            }

            match self
                .to_entry(&path, &name, parent, metadata.is_dir(), &metadata)
                .await
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }

        let next = offset + self.page_size;
        Ok(ListingPage {
            entries,
            next_page_token: (next < total).then(|| next.to_string()),
            total_count: Some(total as u64),
        })
    }

    async fn describe_container(&self, container: &ContainerRef) -> Result<ContainerInfo> {
        let root = self.root(container)?;
        Ok(ContainerInfo {
            name: root
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string),
            owner_id: Some(self.user.id.clone()),
            web_url: Some(format!("file://{}", root.display())),
        })
    }

    async fn whoami(&self) -> Result<Principal> {
        Ok(self.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> ContainerRef {
        ContainerRef::parse("acme", "local", "docs").unwrap()
    }

    fn lister(root: &Path) -> LocalDirectoryLister {
        LocalDirectoryLister::new(ConnectorName::new(LOCAL_CONNECTOR).unwrap())
            .with_root(container(), root)
            .with_user(Principal::new("alice", Some("alice@acme.test".into())))
    }

    #[tokio::test]
    async fn test_lists_root_sorted_with_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "x,y\n1,2\n").unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.7").unwrap();
        std::fs::create_dir(dir.path().join("reports")).unwrap();

        let page = lister(dir.path())
            .list_children(&container(), None, None)
            .await
            .unwrap();

        let ids: Vec<_> = page.entries.iter().map(|e| e.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a.pdf", "b.csv", "reports"]);
        assert_eq!(page.total_count, Some(3));
        assert!(page.next_page_token.is_none());

        let pdf = &page.entries[0];
        assert_eq!(pdf.kind.as_deref(), Some("file"));
        assert_eq!(pdf.path.as_deref(), Some("/a.pdf"));
        assert_eq!(pdf.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(pdf.content_hash.as_ref().map(String::len), Some(64));
        assert_eq!(pdf.owner.as_ref().and_then(|o| o.id.as_deref()), Some("alice"));

        let folder = &page.entries[2];
        assert_eq!(folder.kind.as_deref(), Some("folder"));
        assert!(folder.content_hash.is_none());
    }

    #[tokio::test]
    async fn test_children_carry_parent_and_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("reports/2024")).unwrap();
        std::fs::write(dir.path().join("reports/2024/q1.txt"), "q1").unwrap();

        let lister = lister(dir.path());
        let parent = ExternalId::new("reports/2024").unwrap();
        let page = lister
            .list_children(&container(), Some(&parent), None)
            .await
            .unwrap();

        assert_eq!(page.entries.len(), 1);
        let entry = &page.entries[0];
        assert_eq!(entry.id.as_deref(), Some("reports/2024/q1.txt"));
        assert_eq!(entry.parent_id.as_deref(), Some("reports/2024"));
        assert_eq!(entry.path.as_deref(), Some("/reports/2024/q1.txt"));
    }

    #[tokio::test]
    async fn test_identical_content_has_identical_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "same").unwrap();
        std::fs::write(dir.path().join("two.txt"), "same").unwrap();

        let page = lister(dir.path())
            .list_children(&container(), None, None)
            .await
            .unwrap();
        assert_eq!(page.entries[0].content_hash, page.entries[1].content_hash);
    }

    #[tokio::test]
    async fn test_pagination_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), i.to_string()).unwrap();
        }
        let lister = lister(dir.path()).with_page_size(2);

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = lister
                .list_children(&container(), None, token.as_deref())
                .await
                .unwrap();
            seen.extend(page.entries.into_iter().filter_map(|e| e.id));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec!["f0.txt", "f1.txt", "f2.txt", "f3.txt", "f4.txt"]);
    }

    #[tokio::test]
    async fn test_escape_and_missing_dirs_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let lister = lister(dir.path());

        let escape = ExternalId::new("../etc").unwrap();
        let err = lister
            .list_children(&container(), Some(&escape), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Permanent(_))
        ));

        let missing = ExternalId::new("nope").unwrap();
        let err = lister
            .list_children(&container(), Some(&missing), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_container_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let other = ContainerRef::parse("acme", "local", "other").unwrap();
        let err = lister(dir.path())
            .list_children(&other, None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_describe_container_and_whoami() {
        let dir = tempfile::tempdir().unwrap();
        let lister = lister(dir.path());
        let info = lister.describe_container(&container()).await.unwrap();
        assert_eq!(info.owner_id.as_deref(), Some("alice"));
        assert!(info.web_url.unwrap().starts_with("file://"));
        assert_eq!(lister.whoami().await.unwrap().id, "alice");
    }
}
