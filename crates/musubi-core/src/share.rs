//! Flow-scoped key/value store for passing results between tasks.

use crate::error::Result;
use crate::store::{split_ids, Store};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// ShareData accessor bound to one flow.
///
/// Every read and write goes straight to the [`Store`], so a value set by a
/// task is visible to its dependents even when they run in another worker.
#[derive(Clone)]
pub struct ShareData {
    flow_id: String,
    store: Arc<dyn Store>,
}

impl fmt::Debug for ShareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareData")
            .field("flow_id", &self.flow_id)
            .finish_non_exhaustive()
    }
}

impl ShareData {
    /// Binds an accessor to `flow_id`.
    pub fn new(flow_id: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            flow_id: flow_id.into(),
            store,
        }
    }

    /// Returns the flow this accessor is scoped to.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Returns the value under `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.store.get_share_data(&self.flow_id).await?;
        Ok(data.get(key).cloned())
    }

    /// Overwrites the value under `key`.
    pub async fn set(&self, key: &str, value: impl AsRef<str>) -> Result<()> {
        self.store
            .set_share_data(&self.flow_id, key, value.as_ref())
            .await
    }

    /// Merges identifiers into the collection under `key`; safe to repeat.
    pub async fn append_ids<I, S>(&self, key: &str, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.store.append_share_ids(&self.flow_id, key, &ids).await
    }

    /// Returns the identifiers collected under `key`.
    pub async fn ids(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .get(key)
            .await?
            .map(|v| split_ids(&v).map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Returns every entry.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        self.store.get_share_data(&self.flow_id).await
    }
}
