//! Upstream work-tracker interface consumed by the KPI calculator.
//!
//! Implementations return fully materialized collections; paging is their
//! concern (see [`collect_pages`]). Timeouts surface as ordinary
//! [`UpstreamError`]s.

pub mod fixture;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{CacheStats, TtlCache};
use crate::error::ErrorCode;
use crate::model::{LabelId, WorkItem};

pub use fixture::FixtureUpstream;

/// Hard stop for runaway cursors.
pub const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned more than {MAX_PAGES} pages")]
    TooManyPages,
}

impl UpstreamError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::UpstreamFetchFailed
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolve a label name to its upstream id; `None` when it doesn't exist.
    async fn resolve_label(&self, name: &str) -> Result<Option<LabelId>, UpstreamError>;

    /// Every item of `group` carrying `label`.
    async fn fetch_items(&self, group: &str, label: &str) -> Result<Vec<WorkItem>, UpstreamError>;

    /// Every item of `group`, regardless of labels.
    async fn fetch_group_items(&self, group: &str) -> Result<Vec<WorkItem>, UpstreamError>;
}

#[async_trait]
impl<U: Upstream + ?Sized> Upstream for Arc<U> {
    async fn resolve_label(&self, name: &str) -> Result<Option<LabelId>, UpstreamError> {
        (**self).resolve_label(name).await
    }

    async fn fetch_items(&self, group: &str, label: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        (**self).fetch_items(group, label).await
    }

    async fn fetch_group_items(&self, group: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        (**self).fetch_group_items(group).await
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// Drain a cursor-paginated listing into one collection.
///
/// # Errors
///
/// Propagates the first page error, or [`UpstreamError::TooManyPages`] if the
/// cursor never terminates.
pub async fn collect_pages<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>, UpstreamError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, UpstreamError>>,
{
    let mut out = Vec::new();
    let mut cursor = None;
    for _ in 0..MAX_PAGES {
        let page = fetch_page(cursor).await?;
        out.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
    Err(UpstreamError::TooManyPages)
}

// ---------------------------------------------------------------------------
// CachedUpstream
// ---------------------------------------------------------------------------

const KEY_SEP: char = '\u{1f}';

/// Wraps an [`Upstream`] with TTL caching and single-flight fetches.
pub struct CachedUpstream<U> {
    inner: U,
    ttl: Duration,
    labels: TtlCache<Option<LabelId>>,
    items: TtlCache<Arc<Vec<WorkItem>>>,
}

impl<U: Upstream> CachedUpstream<U> {
    pub fn new(inner: U, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            labels: TtlCache::new(),
            items: TtlCache::new(),
        }
    }

    /// Combined counters for the label and item caches.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let labels = self.labels.stats();
        let items = self.items.stats();
        CacheStats {
            entries: labels.entries + items.entries,
            hits: labels.hits + items.hits,
            misses: labels.misses + items.misses,
            coalesced: labels.coalesced + items.coalesced,
        }
    }

    pub fn clear(&self) {
        self.labels.clear();
        self.items.clear();
    }
}

#[async_trait]
impl<U: Upstream> Upstream for CachedUpstream<U> {
    async fn resolve_label(&self, name: &str) -> Result<Option<LabelId>, UpstreamError> {
        let key = format!("label{KEY_SEP}{name}");
        self.labels
            .get_or_fetch(&key, self.ttl, || self.inner.resolve_label(name))
            .await
    }

    async fn fetch_items(&self, group: &str, label: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        let key = format!("items{KEY_SEP}{group}{KEY_SEP}{label}");
        let items = self
            .items
            .get_or_fetch(&key, self.ttl, || async {
                self.inner.fetch_items(group, label).await.map(Arc::new)
            })
            .await?;
        Ok(items.as_ref().clone())
    }

    async fn fetch_group_items(&self, group: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        let key = format!("group{KEY_SEP}{group}");
        let items = self
            .items
            .get_or_fetch(&key, self.ttl, || async {
                self.inner.fetch_group_items(group).await.map(Arc::new)
            })
            .await?;
        Ok(items.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUpstream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for CountingUpstream {
        async fn resolve_label(&self, name: &str) -> Result<Option<LabelId>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((name == "cycle-1").then(|| "lbl-1".to_string()))
        }

        async fn fetch_items(&self, _group: &str, label: &str) -> Result<Vec<WorkItem>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec![WorkItem {
                id: format!("item-{label}"),
                labels: std::iter::once(label.to_string()).collect(),
                done: false,
                completed_at: None,
            }])
        }

        async fn fetch_group_items(&self, _group: &str) -> Result<Vec<WorkItem>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::Timeout(Duration::from_secs(30)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_upstream_collapses_repeat_reads() {
        let cached = CachedUpstream::new(CountingUpstream::default(), Duration::from_secs(60));

        let (a, b) = tokio::join!(
            cached.fetch_items("Alpha", "lbl-1"),
            cached.fetch_items("Alpha", "lbl-1"),
        );
        assert_eq!(a, b);
        assert_eq!(cached.resolve_label("cycle-1").await, Ok(Some("lbl-1".to_string())));
        assert_eq!(cached.resolve_label("cycle-1").await, Ok(Some("lbl-1".to_string())));
        assert_eq!(cached.resolve_label("nope").await, Ok(None));

        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 3);
        let stats = cached.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.coalesced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_upstream_does_not_cache_failures() {
        let cached = CachedUpstream::new(CountingUpstream::default(), Duration::from_secs(60));
        assert!(cached.fetch_group_items("Alpha").await.is_err());
        assert!(cached.fetch_group_items("Alpha").await.is_err());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn collect_pages_follows_cursor() {
        let pages = vec![vec![1, 2], vec![3], vec![4, 5]];
        let all = collect_pages(|cursor: Option<String>| {
            let index = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0));
            let items = pages[index].clone();
            let next = (index + 1 < pages.len()).then(|| (index + 1).to_string());
            async move { Ok(Page { items, next }) }
        })
        .await;
        assert_eq!(all, Ok(vec![1, 2, 3, 4, 5]));
    }

    #[tokio::test]
    async fn collect_pages_stops_runaway_cursor() {
        let result: Result<Vec<u8>, _> = collect_pages(|_| async {
            Ok(Page {
                items: Vec::new(),
                next: Some("again".to_string()),
            })
        })
        .await;
        assert_eq!(result, Err(UpstreamError::TooManyPages));
    }
}
