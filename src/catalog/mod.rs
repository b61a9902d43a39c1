//! Catalog client: full-text search for identifiers and per-item metadata.
//!
//! The [`Catalog`] trait is the seam the enumerator and resolver are written
//! against; [`ArchiveCatalog`] speaks the Internet Archive's
//! `advancedsearch.php` and `metadata/{id}` endpoints.

pub mod enumerate;
pub mod error;
pub mod resolve;

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

pub use error::CatalogError;

pub const DEFAULT_BASE_URL: &str = "https://archive.org";

const DEFAULT_USER_AGENT: &str = concat!("catalog-packer/", env!("CARGO_PKG_VERSION"));

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    /// Total matches the catalog declares for the query.
    pub total: u64,
    pub identifiers: Vec<String>,
}

/// A file listed in an item's metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Declared size; `None` when absent or unparseable.
    pub size: Option<u64>,
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub identifier: String,
    pub files: Vec<FileEntry>,
}

#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch `rows` results of `query` starting at offset `start`.
    async fn search(&self, query: &str, start: u64, rows: u32) -> Result<SearchPage, CatalogError>;

    async fn metadata(&self, identifier: &str) -> Result<ItemMetadata, CatalogError>;

    /// URL a file of an item is downloaded from.
    fn download_url(&self, identifier: &str, file_name: &str) -> String;
}

/// Build the shared HTTP client.
///
/// Redirects are never followed by the client itself: the transfer engine
/// counts them, and search/metadata endpoints answer directly.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

    Client::builder()
        .default_headers(default_headers)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
}

/// Internet Archive catalog over HTTP.
#[derive(Debug, Clone)]
pub struct ArchiveCatalog {
    client: Client,
    base_url: String,
}

impl ArchiveCatalog {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_text(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, CatalogError> {
        let response = request.send().await.map_err(|e| CatalogError::Http {
            url: url.to_string(),
            source: e,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response.text().await.map_err(|e| CatalogError::Http {
            url: url.to_string(),
            source: e,
        })
    }
}

#[async_trait::async_trait]
impl Catalog for ArchiveCatalog {
    async fn search(&self, query: &str, start: u64, rows: u32) -> Result<SearchPage, CatalogError> {
        let url = format!("{}/advancedsearch.php", self.base_url);
        let rows_param = rows.to_string();
        let start_param = start.to_string();
        let request = self.client.get(&url).query(&[
            ("q", query),
            ("fl[]", "identifier"),
            ("rows", rows_param.as_str()),
            ("start", start_param.as_str()),
            ("output", "json"),
        ]);
        tracing::debug!(query, start, rows, "Fetching search page");
        let body = self.get_text(request, &url).await?;
        parse_search(&url, &body)
    }

    async fn metadata(&self, identifier: &str) -> Result<ItemMetadata, CatalogError> {
        let url = format!(
            "{}/metadata/{}",
            self.base_url,
            urlencoding::encode(identifier)
        );
        let body = self.get_text(self.client.get(&url), &url).await?;
        parse_metadata(identifier, &url, &body)
    }

    fn download_url(&self, identifier: &str, file_name: &str) -> String {
        // File names may contain subdirectories; keep the separators.
        let path = file_name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/download/{}/{}",
            self.base_url,
            urlencoding::encode(identifier),
            path
        )
    }
}

#[derive(Deserialize)]
struct SearchEnvelope {
    response: SearchBody,
}

#[derive(Deserialize)]
struct SearchBody {
    #[serde(rename = "numFound")]
    num_found: u64,
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Deserialize)]
struct SearchDoc {
    identifier: Option<String>,
}

fn parse_search(url: &str, body: &str) -> Result<SearchPage, CatalogError> {
    let envelope: SearchEnvelope = serde_json::from_str(body).map_err(|e| CatalogError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(SearchPage {
        total: envelope.response.num_found,
        identifiers: envelope
            .response
            .docs
            .into_iter()
            .filter_map(|d| d.identifier)
            .filter(|id| !id.is_empty())
            .collect(),
    })
}

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Deserialize)]
struct RawFile {
    name: Option<String>,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    sha1: Option<String>,
}

/// Sizes arrive as numbers or as numeric strings depending on the item.
fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_metadata(identifier: &str, url: &str, body: &str) -> Result<ItemMetadata, CatalogError> {
    let raw: RawMetadata = serde_json::from_str(body).map_err(|e| CatalogError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let files = raw
        .files
        .into_iter()
        .filter_map(|f| {
            let name = f.name.filter(|n| !n.is_empty())?;
            Some(FileEntry {
                name,
                size: f.size.as_ref().and_then(parse_size),
                sha1: f.sha1.filter(|s| !s.is_empty()),
            })
        })
        .collect();
    Ok(ItemMetadata {
        identifier: identifier.to_string(),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeArchive;

    #[test]
    fn test_parse_search_page() {
        let body = r#"{"responseHeader":{},"response":{"numFound":1234,"start":0,"docs":[{"identifier":"a"},{"identifier":"b"},{}]}}"#;
        let page = parse_search("u", body).unwrap();
        assert_eq!(page.total, 1234);
        assert_eq!(page.identifiers, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_search_html_is_decode_error() {
        let err = parse_search("u", "<html>busy</html>").unwrap_err();
        assert!(matches!(err, CatalogError::Decode { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_metadata_sizes() {
        let body = r#"{"files":[
            {"name":"game.swf","size":"2048","sha1":"abc"},
            {"name":"cover.png","size":512},
            {"name":"notes.txt"},
            {"size":"1"}
        ]}"#;
        let meta = parse_metadata("item", "u", body).unwrap();
        assert_eq!(meta.files.len(), 3);
        assert_eq!(meta.files[0].size, Some(2048));
        assert_eq!(meta.files[0].sha1.as_deref(), Some("abc"));
        assert_eq!(meta.files[1].size, Some(512));
        assert_eq!(meta.files[2].size, None);
    }

    #[test]
    fn test_parse_metadata_empty_document() {
        // Unknown identifiers come back as `{}`.
        let meta = parse_metadata("gone", "u", "{}").unwrap();
        assert!(meta.files.is_empty());
    }

    #[test]
    fn test_download_url_encodes_segments() {
        let catalog = ArchiveCatalog::new(Client::new(), "https://archive.org/");
        assert_eq!(
            catalog.download_url("my item", "sub dir/game #1.swf"),
            "https://archive.org/download/my%20item/sub%20dir/game%20%231.swf"
        );
    }

    #[tokio::test]
    async fn test_search_and_metadata_against_server() {
        let fake = FakeArchive::new();
        fake.add_item("alpha", &[("alpha.swf", Some(10))]);
        fake.add_item("beta", &[("beta.swf", Some(20))]);
        let server = fake.serve().await;
        let catalog = server.catalog();

        let page = catalog.search("collection:test", 0, 10).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.identifiers, vec!["alpha", "beta"]);

        let meta = catalog.metadata("beta").await.unwrap();
        assert_eq!(meta.files[0].name, "beta.swf");
        assert_eq!(meta.files[0].size, Some(20));
    }

    #[tokio::test]
    async fn test_metadata_server_error_is_status() {
        let fake = FakeArchive::new();
        fake.add_item("alpha", &[("alpha.swf", Some(10))]);
        fake.fail_metadata("alpha", 503);
        let server = fake.serve().await;

        let err = server.catalog().metadata("alpha").await.unwrap_err();
        assert!(matches!(err, CatalogError::Status { status: 503, .. }));
    }
}
