//! JSON-file-backed upstream for offline runs and tests.
//!
//! ```json
//! {
//!   "labels": { "cycle-1": "lbl_c1", "cancelled": "lbl_x" },
//!   "page_size": 50,
//!   "unavailable_groups": ["Gamma"],
//!   "items": [
//!     { "id": "A", "group": "Alpha", "labels": ["lbl_c1"], "done": true,
//!       "completed_at": "2026-01-12T10:00:00Z" }
//!   ]
//! }
//! ```
//!
//! When `labels` is empty every label name resolves to itself if any item
//! carries it. Groups listed in `unavailable_groups` fail every fetch, which
//! lets callers exercise partial-failure runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{Page, Upstream, UpstreamError, collect_pages};
use crate::model::{LabelId, WorkItem};

#[derive(Debug, Clone, Deserialize)]
struct FixtureItem {
    group: String,
    #[serde(flatten)]
    item: WorkItem,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFile {
    #[serde(default)]
    labels: BTreeMap<String, LabelId>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    unavailable_groups: BTreeSet<String>,
    #[serde(default)]
    items: Vec<FixtureItem>,
}

#[derive(Debug, Clone, Default)]
pub struct FixtureUpstream {
    data: FixtureFile,
}

impl FixtureUpstream {
    /// Load a fixture file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid fixture.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read upstream fixture {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse upstream fixture {}", path.display()))
    }

    /// Parse fixture JSON held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the fixture shape.
    pub fn from_json(json: &str) -> Result<Self> {
        let data: FixtureFile = serde_json::from_str(json)?;
        Ok(Self { data })
    }

    fn check_available(&self, group: &str) -> Result<(), UpstreamError> {
        if self.data.unavailable_groups.contains(group) {
            return Err(UpstreamError::Request(format!("group '{group}' is unavailable")));
        }
        Ok(())
    }

    /// Serve `matching` items as cursor pages so callers go through the same
    /// paging path a remote tracker needs.
    async fn paged(&self, matching: Vec<WorkItem>) -> Result<Vec<WorkItem>, UpstreamError> {
        let page_size = self.data.page_size.unwrap_or(usize::MAX).max(1);
        collect_pages(|cursor: Option<String>| {
            let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
            let end = start.saturating_add(page_size).min(matching.len());
            let items = matching[start.min(end)..end].to_vec();
            let next = (end < matching.len()).then(|| end.to_string());
            async move { Ok(Page { items, next }) }
        })
        .await
    }
}

#[async_trait]
impl Upstream for FixtureUpstream {
    async fn resolve_label(&self, name: &str) -> Result<Option<LabelId>, UpstreamError> {
        if self.data.labels.is_empty() {
            let used = self.data.items.iter().any(|entry| entry.item.has_label(name));
            return Ok(used.then(|| name.to_string()));
        }
        Ok(self.data.labels.get(name).cloned())
    }

    async fn fetch_items(&self, group: &str, label: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        self.check_available(group)?;
        let matching = self
            .data
            .items
            .iter()
            .filter(|entry| entry.group == group && entry.item.has_label(label))
            .map(|entry| entry.item.clone())
            .collect();
        self.paged(matching).await
    }

    async fn fetch_group_items(&self, group: &str) -> Result<Vec<WorkItem>, UpstreamError> {
        self.check_available(group)?;
        let matching = self
            .data
            .items
            .iter()
            .filter(|entry| entry.group == group)
            .map(|entry| entry.item.clone())
            .collect();
        self.paged(matching).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "labels": { "cycle-1": "lbl_c1", "cancelled": "lbl_x" },
        "page_size": 2,
        "unavailable_groups": ["Gamma"],
        "items": [
            { "id": "A", "group": "Alpha", "labels": ["lbl_c1"] },
            { "id": "B", "group": "Alpha", "labels": ["lbl_c1"], "done": true,
              "completed_at": "2026-01-12T10:00:00Z" },
            { "id": "C", "group": "Alpha", "labels": ["lbl_c1", "lbl_x"] },
            { "id": "D", "group": "Beta", "labels": ["lbl_c1"] },
            { "id": "E", "group": "Alpha", "labels": [] }
        ]
    }"#;

    #[tokio::test]
    async fn fetches_across_pages() {
        let upstream = FixtureUpstream::from_json(FIXTURE).expect("fixture");
        let items = upstream.fetch_items("Alpha", "lbl_c1").await.expect("items");
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);

        let all = upstream.fetch_group_items("Alpha").await.expect("group items");
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn resolves_labels_by_name() {
        let upstream = FixtureUpstream::from_json(FIXTURE).expect("fixture");
        assert_eq!(upstream.resolve_label("cycle-1").await, Ok(Some("lbl_c1".to_string())));
        assert_eq!(upstream.resolve_label("cycle-9").await, Ok(None));
    }

    #[tokio::test]
    async fn unlabelled_fixture_resolves_used_names() {
        let upstream = FixtureUpstream::from_json(
            r#"{ "items": [ { "id": "A", "group": "Alpha", "labels": ["cycle-1"] } ] }"#,
        )
        .expect("fixture");
        assert_eq!(upstream.resolve_label("cycle-1").await, Ok(Some("cycle-1".to_string())));
        assert_eq!(upstream.resolve_label("cycle-2").await, Ok(None));
    }

    #[tokio::test]
    async fn unavailable_group_fails() {
        let upstream = FixtureUpstream::from_json(FIXTURE).expect("fixture");
        let err = upstream.fetch_items("Gamma", "lbl_c1").await.expect_err("unavailable");
        assert!(matches!(err, UpstreamError::Request(_)));
    }
}
