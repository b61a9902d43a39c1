//! Test doubles: an in-process fake archive, a fake GitHub API and a
//! recording publisher.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::catalog::{build_http_client, ArchiveCatalog, Catalog};
use crate::pack::PackTarget;
use crate::publish::{PublishError, PublishOutcome, Publisher};

#[derive(Debug, Clone)]
struct FakeFile {
    name: String,
    declared: Option<u64>,
    body: Vec<u8>,
    /// Serve without a Content-Length header.
    chunked: bool,
}

type FileKey = (String, String);

#[derive(Debug, Default)]
struct ArchiveState {
    order: Vec<String>,
    files: HashMap<String, Vec<FakeFile>>,
    result_cap: Option<usize>,
    search_extra: Vec<String>,
    short_pages: HashSet<u64>,
    search_failure: Option<u16>,
    metadata_failures: HashMap<String, u16>,
    /// Status and remaining count; `u32::MAX` never runs out.
    download_failures: HashMap<FileKey, (u16, u32)>,
    redirects: HashMap<FileKey, u32>,
    search_hits: u32,
    metadata_hits: HashMap<String, u32>,
    download_hits: HashMap<String, u32>,
}

/// Fake archive.org: `advancedsearch.php`, `metadata/{id}` and
/// `download/{id}/{file}` with failure injection and hit counters.
#[derive(Debug, Clone, Default)]
pub struct FakeArchive {
    state: Arc<Mutex<ArchiveState>>,
}

impl FakeArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ArchiveState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn push_file(&self, id: &str, file: FakeFile) {
        self.with_state(|s| {
            if !s.files.contains_key(id) {
                s.order.push(id.to_string());
            }
            s.files.entry(id.to_string()).or_default().push(file);
        });
    }

    /// Add files whose bodies are exactly their declared size (16 bytes when
    /// the size is undeclared).
    pub fn add_item(&self, id: &str, files: &[(&str, Option<u64>)]) {
        if files.is_empty() {
            self.with_state(|s| {
                s.order.push(id.to_string());
                s.files.entry(id.to_string()).or_default();
            });
        }
        for (name, declared) in files {
            let len = declared.unwrap_or(16) as usize;
            self.add_file_with_body(id, name, *declared, vec![b'x'; len]);
        }
    }

    pub fn add_file_with_body(&self, id: &str, name: &str, declared: Option<u64>, body: Vec<u8>) {
        self.push_file(
            id,
            FakeFile {
                name: name.to_string(),
                declared,
                body,
                chunked: false,
            },
        );
    }

    pub fn hide_content_length(&self, id: &str, name: &str) {
        self.with_state(|s| {
            if let Some(f) = s
                .files
                .get_mut(id)
                .and_then(|files| files.iter_mut().find(|f| f.name == name))
            {
                f.chunked = true;
            }
        });
    }

    /// Only the first `cap` results of any query can be paged through.
    pub fn set_result_cap(&self, cap: usize) {
        self.with_state(|s| s.result_cap = Some(cap));
    }

    /// Report `id` in every search response, whatever the query.
    pub fn add_search_extra(&self, id: &str) {
        self.with_state(|s| s.search_extra.push(id.to_string()));
    }

    /// The next page requested at `start` returns only half its rows.
    pub fn short_page_once(&self, start: u64) {
        self.with_state(|s| s.short_pages.insert(start));
    }

    pub fn fail_search(&self, status: u16) {
        self.with_state(|s| s.search_failure = Some(status));
    }

    pub fn fail_metadata(&self, id: &str, status: u16) {
        self.with_state(|s| s.metadata_failures.insert(id.to_string(), status));
    }

    /// Answer the next `times` downloads of a file with `status`.
    pub fn fail_download(&self, id: &str, file: &str, status: u16, times: u32) {
        self.with_state(|s| {
            s.download_failures
                .insert((id.to_string(), file.to_string()), (status, times))
        });
    }

    /// Redirect downloads of a file `hops` times before serving it.
    pub fn redirect(&self, id: &str, file: &str, hops: u32) {
        self.with_state(|s| s.redirects.insert((id.to_string(), file.to_string()), hops));
    }

    pub fn search_hits(&self) -> u32 {
        self.with_state(|s| s.search_hits)
    }

    pub fn metadata_hits(&self, id: &str) -> u32 {
        self.with_state(|s| s.metadata_hits.get(id).copied().unwrap_or(0))
    }

    /// Download requests for any file of `id`, not counting redirect hops.
    pub fn download_hits(&self, id: &str) -> u32 {
        self.with_state(|s| s.download_hits.get(id).copied().unwrap_or(0))
    }

    pub fn total_download_hits(&self) -> u32 {
        self.with_state(|s| s.download_hits.values().sum())
    }

    pub async fn serve(&self) -> FakeServer {
        let app = Router::new()
            .route("/advancedsearch.php", get(search))
            .route("/metadata/{id}", get(metadata))
            .route("/download/{id}/{*file}", get(download))
            .route("/hop/{n}/{id}/{*file}", get(hop))
            .with_state(self.clone());
        let base_url = spawn(app).await;
        let catalog = ArchiveCatalog::new(
            build_http_client(Duration::from_secs(5)).unwrap(),
            &base_url,
        );
        FakeServer { base_url, catalog }
    }
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().expect("Failed to get local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });
    format!("http://{}", addr)
}

fn status_only(status: u16) -> Response {
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

fn redirect_to(n: u32, id: &str, file: &str) -> Response {
    let file = file
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let location = format!("/hop/{}/{}/{}", n, urlencoding::encode(id), file);
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn search(
    State(fake): State<FakeArchive>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let query = params.get("q").cloned().unwrap_or_default();
    let start: usize = params.get("start").and_then(|v| v.parse().ok()).unwrap_or(0);
    let rows: usize = params.get("rows").and_then(|v| v.parse().ok()).unwrap_or(50);

    fake.with_state(|s| {
        s.search_hits += 1;
        if let Some(status) = s.search_failure {
            return status_only(status);
        }

        let prefix = query
            .split(" AND identifier:")
            .nth(1)
            .map(|p| p.trim_end_matches('*').to_string());
        let mut ids: Vec<String> = s
            .order
            .iter()
            .filter(|id| prefix.as_deref().map_or(true, |p| id.starts_with(p)))
            .cloned()
            .collect();
        for extra in &s.search_extra {
            if !ids.contains(extra) {
                ids.push(extra.clone());
            }
        }

        let total = ids.len();
        let reachable = s.result_cap.map_or(total, |cap| cap.min(total));
        let begin = start.min(reachable);
        let end = (start + rows).min(reachable);
        let mut page = ids[begin..end].to_vec();
        if s.short_pages.remove(&(start as u64)) && page.len() > 1 {
            page.truncate(page.len() / 2);
        }

        let docs: Vec<Value> = page.iter().map(|id| json!({ "identifier": id })).collect();
        Json(json!({
            "responseHeader": { "status": 0 },
            "response": { "numFound": total, "start": start, "docs": docs }
        }))
        .into_response()
    })
}

async fn metadata(State(fake): State<FakeArchive>, Path(id): Path<String>) -> Response {
    fake.with_state(|s| {
        *s.metadata_hits.entry(id.clone()).or_default() += 1;
        if let Some(status) = s.metadata_failures.get(&id) {
            return status_only(*status);
        }
        let Some(files) = s.files.get(&id) else {
            return Json(json!({})).into_response();
        };
        let files: Vec<Value> = files
            .iter()
            .map(|f| {
                // Sizes come back as strings, like the real service.
                json!({ "name": f.name, "size": f.declared.map(|n| n.to_string()) })
            })
            .collect();
        Json(json!({ "files": files })).into_response()
    })
}

fn serve_file(s: &mut ArchiveState, id: &str, file: &str) -> Response {
    let key = (id.to_string(), file.to_string());
    if let Some((status, remaining)) = s.download_failures.get_mut(&key) {
        if *remaining > 0 {
            if *remaining != u32::MAX {
                *remaining -= 1;
            }
            return status_only(*status);
        }
    }

    let Some(f) = s
        .files
        .get(id)
        .and_then(|files| files.iter().find(|f| f.name == file))
    else {
        return status_only(404);
    };

    if f.chunked {
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from(f.body.clone()))];
        Response::new(Body::from_stream(futures_util::stream::iter(chunks)))
    } else {
        (StatusCode::OK, f.body.clone()).into_response()
    }
}

async fn download(
    State(fake): State<FakeArchive>,
    Path((id, file)): Path<(String, String)>,
) -> Response {
    fake.with_state(|s| {
        *s.download_hits.entry(id.clone()).or_default() += 1;
        match s.redirects.get(&(id.clone(), file.clone())) {
            Some(&hops) if hops > 0 => redirect_to(hops - 1, &id, &file),
            _ => serve_file(s, &id, &file),
        }
    })
}

async fn hop(
    State(fake): State<FakeArchive>,
    Path((n, id, file)): Path<(u32, String, String)>,
) -> Response {
    if n > 0 {
        return redirect_to(n - 1, &id, &file);
    }
    fake.with_state(|s| serve_file(s, &id, &file))
}

/// A running [`FakeArchive`].
pub struct FakeServer {
    pub base_url: String,
    catalog: ArchiveCatalog,
}

impl FakeServer {
    pub fn catalog(&self) -> ArchiveCatalog {
        self.catalog.clone()
    }

    pub fn catalog_arc(&self) -> Arc<dyn Catalog> {
        Arc::new(self.catalog.clone())
    }

    pub fn download_url(&self, id: &str, file: &str) -> String {
        self.catalog.download_url(id, file)
    }
}

#[derive(Debug, Default)]
struct GitHubState {
    repos: HashSet<String>,
    created: Vec<String>,
    last_auth: Option<String>,
    reject_auth: bool,
    unavailable: u32,
    hits: u32,
}

/// Fake GitHub REST API: `GET /repos/{owner}/{name}` and `POST /user/repos`.
pub struct FakeGitHub {
    pub base_url: String,
    state: Arc<Mutex<GitHubState>>,
}

type GitHubShared = Arc<Mutex<GitHubState>>;

fn check_auth(s: &mut GitHubState, headers: &HeaderMap) -> Option<Response> {
    s.hits += 1;
    if s.unavailable > 0 {
        s.unavailable -= 1;
        return Some(
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "message": "Server Error" })),
            )
                .into_response(),
        );
    }
    s.last_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    s.reject_auth.then(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Bad credentials" })),
        )
            .into_response()
    })
}

async fn get_repo(
    State(state): State<GitHubShared>,
    headers: HeaderMap,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    let mut s = state.lock().unwrap();
    if let Some(rejected) = check_auth(&mut s, &headers) {
        return rejected;
    }
    if s.repos.contains(&format!("{}/{}", owner, name)) {
        Json(json!({ "full_name": format!("{}/{}", owner, name) })).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" }))).into_response()
    }
}

async fn create_repo(
    State(state): State<GitHubShared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut s = state.lock().unwrap();
    if let Some(rejected) = check_auth(&mut s, &headers) {
        return rejected;
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    s.repos.insert(format!("me/{}", name));
    s.created.push(name.clone());
    (StatusCode::CREATED, Json(json!({ "name": name }))).into_response()
}

impl FakeGitHub {
    pub async fn serve(existing: &[&str]) -> Self {
        let state: GitHubShared = Arc::new(Mutex::new(GitHubState {
            repos: existing.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }));
        let app = Router::new()
            .route("/repos/{owner}/{name}", get(get_repo))
            .route("/user/repos", post(create_repo))
            .with_state(state.clone());
        let base_url = spawn(app).await;
        Self { base_url, state }
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn last_auth(&self) -> Option<String> {
        self.state.lock().unwrap().last_auth.clone()
    }

    pub fn reject_auth(&self) {
        self.state.lock().unwrap().reject_auth = true;
    }

    /// Answer the next `times` requests with 502.
    pub fn fail_next(&self, times: u32) {
        self.state.lock().unwrap().unavailable = times;
    }

    /// Requests received, including failed ones.
    pub fn hits(&self) -> u32 {
        self.state.lock().unwrap().hits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    Prepare { pack: String },
    Publish { pack: String, message: String },
}

/// Publisher that records calls and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<PublishEvent>>>,
    fail_prefix: Arc<Mutex<Option<String>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish whose message starts with `prefix`.
    pub fn fail_publish_matching(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn events(&self) -> Vec<PublishEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PublishEvent::Publish { message, .. } => Some(message),
                PublishEvent::Prepare { .. } => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    async fn prepare(&self, target: &PackTarget) -> Result<(), PublishError> {
        std::fs::create_dir_all(&target.workspace).map_err(|e| PublishError::Io {
            path: target.workspace.clone(),
            source: e,
        })?;
        self.events.lock().unwrap().push(PublishEvent::Prepare {
            pack: target.name.clone(),
        });
        Ok(())
    }

    async fn publish(&self, target: &PackTarget, message: &str) -> Result<PublishOutcome, PublishError> {
        let failing = self
            .fail_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|p| message.starts_with(p));
        if failing {
            return Err(PublishError::Push {
                name: target.name.clone(),
                stderr: "simulated outage".into(),
            });
        }
        self.events.lock().unwrap().push(PublishEvent::Publish {
            pack: target.name.clone(),
            message: message.to_string(),
        });
        Ok(PublishOutcome {
            committed: true,
            pushed: true,
        })
    }
}
