//! Pick the primary and cover assets of an item and gate them by size.

use super::{Catalog, CatalogError, FileEntry, ItemMetadata};
use crate::state::SkipReason;

/// Which files of an item matter and how large they may be.
#[derive(Debug, Clone)]
pub struct AssetRule {
    /// Primary extension without the dot, lowercase.
    pub primary_ext: String,
    /// Accepted cover extensions, lowercase.
    pub cover_exts: Vec<String>,
    pub require_cover: bool,
    pub max_item_bytes: u64,
}

/// A file chosen for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub file_name: String,
    pub url: String,
    /// Declared size; `None` means unknown and enforced while streaming.
    pub size: Option<u64>,
    pub sha1: Option<String>,
    /// Lowercase extension used for the stored file name.
    pub ext: String,
}

impl Asset {
    pub fn declared_bytes(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAssets {
    pub identifier: String,
    pub primary: Option<Asset>,
    pub cover: Option<Asset>,
}

/// Assets that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAssets {
    pub identifier: String,
    pub primary: Asset,
    pub cover: Option<Asset>,
}

impl SelectedAssets {
    /// Declared primary plus cover size, unknown sizes counted as zero.
    pub fn declared_bytes(&self) -> u64 {
        self.primary.declared_bytes()
            + self.cover.as_ref().map(Asset::declared_bytes).unwrap_or(0)
    }
}

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty() && !ext.contains('/')).then(|| ext.to_ascii_lowercase())
}

fn to_asset(catalog: &dyn Catalog, identifier: &str, file: &FileEntry, ext: String) -> Asset {
    Asset {
        file_name: file.name.clone(),
        url: catalog.download_url(identifier, &file.name),
        size: file.size,
        sha1: file.sha1.clone(),
        ext,
    }
}

/// Pick assets from an already-fetched metadata document.
pub fn select_assets(catalog: &dyn Catalog, meta: &ItemMetadata, rule: &AssetRule) -> ResolvedAssets {
    let primary_index = meta
        .files
        .iter()
        .position(|f| extension_of(&f.name).as_deref() == Some(rule.primary_ext.as_str()));

    let primary = primary_index.map(|i| {
        to_asset(
            catalog,
            &meta.identifier,
            &meta.files[i],
            rule.primary_ext.clone(),
        )
    });

    // First file (in listing order) whose extension is any cover extension.
    let cover = meta
        .files
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != primary_index)
        .find_map(|(_, f)| {
            let ext = extension_of(&f.name)?;
            rule.cover_exts
                .contains(&ext)
                .then(|| to_asset(catalog, &meta.identifier, f, ext))
        });

    ResolvedAssets {
        identifier: meta.identifier.clone(),
        primary,
        cover,
    }
}

/// Fetch metadata for `identifier` and pick its assets.
pub async fn resolve(
    catalog: &dyn Catalog,
    identifier: &str,
    rule: &AssetRule,
) -> Result<ResolvedAssets, CatalogError> {
    let meta = catalog.metadata(identifier).await?;
    Ok(select_assets(catalog, &meta, rule))
}

/// Apply the asset and size rules. No bytes are transferred for a rejected item.
pub fn gate(resolved: ResolvedAssets, rule: &AssetRule) -> Result<SelectedAssets, SkipReason> {
    let Some(primary) = resolved.primary else {
        return Err(SkipReason::NoAsset);
    };
    if rule.require_cover && resolved.cover.is_none() {
        return Err(SkipReason::NoAsset);
    }
    if primary.declared_bytes() > rule.max_item_bytes {
        return Err(SkipReason::Oversize);
    }
    Ok(SelectedAssets {
        identifier: resolved.identifier,
        primary,
        cover: resolved.cover,
    })
}
