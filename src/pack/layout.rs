//! On-disk layout of packs, item directories and the staging area.
//!
//! ```text
//! <work-dir>/
//!   packs/<name>/<items-dir>/<identifier>/<identifier>.<ext>
//!                                         cover.<ext>
//!   staging/<identifier>/...
//! ```

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

pub const DEFAULT_TEMPLATE: &str = "flash-pack-{ordinal}";
pub const DEFAULT_ITEMS_DIR: &str = "games";
pub const ORDINAL_PLACEHOLDER: &str = "{ordinal}";

const PACKS_DIR: &str = "packs";
const STAGING_DIR: &str = "staging";

/// Deterministic name, ordinal and local workspace of one pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackTarget {
    pub ordinal: u32,
    pub name: String,
    pub workspace: PathBuf,
}

/// Make an identifier safe to use as a single path component.
///
/// Catalog identifiers are normally `[A-Za-z0-9._-]`; anything that could
/// escape the item directory is replaced.
pub fn clean_identifier(identifier: &str) -> String {
    let cleaned: String = identifier
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct PackLayout {
    work_dir: PathBuf,
    template: String,
    items_dir: String,
}

impl PackLayout {
    pub fn new(work_dir: &Path, template: &str, items_dir: &str) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            template: template.to_string(),
            items_dir: items_dir.to_string(),
        }
    }

    /// Pack name with the ordinal zero-padded to three digits.
    pub fn pack_name(&self, ordinal: u32) -> String {
        self.template
            .replace(ORDINAL_PLACEHOLDER, &format!("{:03}", ordinal))
    }

    pub fn target(&self, ordinal: u32) -> PackTarget {
        let name = self.pack_name(ordinal);
        PackTarget {
            ordinal,
            workspace: self.work_dir.join(PACKS_DIR).join(&name),
            name,
        }
    }

    pub fn items_root(&self, target: &PackTarget) -> PathBuf {
        target.workspace.join(&self.items_dir)
    }

    pub fn item_dir(&self, target: &PackTarget, identifier: &str) -> PathBuf {
        self.items_root(target).join(clean_identifier(identifier))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.work_dir.join(STAGING_DIR)
    }

    pub fn staging_dir(&self, identifier: &str) -> PathBuf {
        self.staging_root().join(clean_identifier(identifier))
    }

    pub fn primary_file_name(identifier: &str, ext: &str) -> String {
        format!("{}.{}", clean_identifier(identifier), ext)
    }

    pub fn cover_file_name(ext: &str) -> String {
        format!("cover.{}", ext)
    }

    /// Remove anything left in the staging area by an interrupted run.
    pub async fn clear_staging(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.staging_root()).await
    }

    pub async fn discard_staged(&self, identifier: &str) -> io::Result<()> {
        remove_dir_if_exists(&self.staging_dir(identifier)).await
    }

    /// Move a fully staged item into the pack. Any stale directory for the
    /// same identifier is replaced.
    pub async fn move_into_pack(&self, target: &PackTarget, identifier: &str) -> io::Result<PathBuf> {
        let staged = self.staging_dir(identifier);
        let dest = self.item_dir(target, identifier);
        fs::create_dir_all(self.items_root(target)).await?;
        remove_dir_if_exists(&dest).await?;
        fs::rename(&staged, &dest).await?;
        Ok(dest)
    }

    /// Delete item directories in `target` that are not recorded as completed.
    /// Returns the directory names removed.
    pub async fn prune_orphans(
        &self,
        target: &PackTarget,
        completed: &HashSet<String>,
    ) -> io::Result<Vec<String>> {
        let root = self.items_root(target);
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let keep: HashSet<String> = completed.iter().map(|id| clean_identifier(id)).collect();
        let mut removed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            removed.push(name);
        }
        removed.sort();
        Ok(removed)
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Total size of the regular files under `path`, recursively.
pub async fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }
    Ok(total)
}
