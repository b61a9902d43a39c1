//! Lazy, deduplicated enumeration of catalog identifiers.
//!
//! Pages are fetched on demand as the consumer pulls from the stream, so the
//! pipeline starts processing the first item before the catalog has been
//! walked. The enumeration keeps no persisted cursor: a restart walks from the
//! beginning and the progress store filters what is already done.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};

use super::{Catalog, CatalogError};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::types::PartitionMode;

/// Leading identifier characters used for prefix partitions.
const PREFIX_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone)]
pub struct EnumerateConfig {
    pub query: String,
    pub page_size: u32,
    pub partition: PartitionMode,
    /// Number of results the upstream search will page through for a single
    /// query. `auto` partitioning kicks in when a query declares at least this
    /// many matches.
    pub result_cap: u64,
    pub retry: RetryConfig,
}

/// The 36 disjoint prefix-partition queries for `query`.
pub fn prefix_queries(query: &str) -> Vec<String> {
    PREFIX_ALPHABET
        .chars()
        .map(|c| format!("({}) AND identifier:{}*", query, c))
        .collect()
}

/// Pagination state of one query.
struct QueryCursor {
    query: String,
    start: u64,
    total: Option<u64>,
    /// The unpartitioned query in `auto` mode; its first page decides whether
    /// prefix partitions are needed.
    probe: bool,
}

impl QueryCursor {
    fn new(query: String, probe: bool) -> Self {
        Self {
            query,
            start: 0,
            total: None,
            probe,
        }
    }

    fn exhausted(&self) -> bool {
        matches!(self.total, Some(total) if self.start >= total)
    }
}

struct EnumState {
    catalog: Arc<dyn Catalog>,
    config: EnumerateConfig,
    queries: VecDeque<QueryCursor>,
    buffer: VecDeque<String>,
    seen: HashSet<String>,
    failed: bool,
}

impl EnumState {
    fn new(catalog: Arc<dyn Catalog>, config: EnumerateConfig) -> Self {
        let queries = match config.partition {
            PartitionMode::Single => VecDeque::from([QueryCursor::new(config.query.clone(), false)]),
            PartitionMode::Auto => VecDeque::from([QueryCursor::new(config.query.clone(), true)]),
            PartitionMode::Prefix => prefix_queries(&config.query)
                .into_iter()
                .map(|q| QueryCursor::new(q, false))
                .collect(),
        };
        Self {
            catalog,
            config,
            queries,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            failed: false,
        }
    }

    /// Produce the next unseen identifier, fetching pages as needed.
    async fn next_identifier(&mut self) -> Option<Result<String, CatalogError>> {
        loop {
            while let Some(id) = self.buffer.pop_front() {
                if self.seen.insert(id.clone()) {
                    return Some(Ok(id));
                }
            }
            if self.failed {
                return None;
            }

            let cursor = self.queries.front_mut()?;
            if cursor.exhausted() {
                self.queries.pop_front();
                continue;
            }

            let catalog = &self.catalog;
            let (query, start, rows) = (cursor.query.clone(), cursor.start, self.config.page_size);
            let page = retry::retry_with_backoff(
                &self.config.retry,
                "Catalog search",
                |e: &CatalogError| {
                    if e.is_retryable() {
                        RetryAction::Retry
                    } else {
                        RetryAction::Abort
                    }
                },
                || catalog.search(&query, start, rows),
            )
            .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            let mut partitions = None;
            if cursor.probe && cursor.total.is_none() && page.total >= self.config.result_cap {
                partitions = Some(prefix_queries(&self.config.query));
            }

            // A short page is not the end; only an empty page or the declared
            // total is.
            cursor.total = Some(page.total);
            cursor.start += page.identifiers.len() as u64;
            let empty = page.identifiers.is_empty();
            tracing::debug!(
                query = %cursor.query,
                start = cursor.start,
                total = page.total,
                "Fetched {} identifiers",
                page.identifiers.len()
            );
            self.buffer.extend(page.identifiers);
            if empty {
                self.queries.pop_front();
            }

            if let Some(partitions) = partitions {
                tracing::info!(
                    total = page.total,
                    cap = self.config.result_cap,
                    "Query reaches the search result cap, adding {} prefix partitions",
                    partitions.len()
                );
                self.queries
                    .extend(partitions.into_iter().map(|q| QueryCursor::new(q, false)));
            }
        }
    }
}

/// Stream every distinct identifier matched by the configured query.
///
/// A failed page fetch (after retries) is yielded once as an error and ends
/// the stream.
pub fn identifiers(
    catalog: Arc<dyn Catalog>,
    config: EnumerateConfig,
) -> BoxStream<'static, Result<String, CatalogError>> {
    stream::unfold(EnumState::new(catalog, config), |mut state| async move {
        let next = state.next_identifier().await?;
        Some((next, state))
    })
    .boxed()
}
