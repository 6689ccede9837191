//! Storage of task instances for the URL service.
//!
//! A task instance is a free-form JSON document. The fields the service relies
//! on are `task_id`, `occupation_id`, `available` and `assigned_at`; the URLs
//! (`task_url`, `response_url_1..5`) are passed through untouched.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

pub type Fields = Map<String, Value>;

/// Maximum number of writes grouped into one commit.
pub const WRITE_BATCH_SIZE: usize = 400;

/// Maximum number of deletes grouped into one commit.
pub const DELETE_BATCH_SIZE: usize = 500;

/// Number of response URLs stored on each instance.
pub const RESPONSE_URL_FIELDS: [&str; 5] = [
    "response_url_1",
    "response_url_2",
    "response_url_3",
    "response_url_4",
    "response_url_5",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Fields,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
}

impl StoredDocument {
    #[must_use]
    pub fn new(id: &str, fields: Fields) -> Self {
        Self {
            id: id.to_string(),
            fields,
            create_time: None,
            update_time: None,
        }
    }

    /// Instances without an `available` flag count as available.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.fields
            .get("available")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// When the instance was handed out, if it has been and the timestamp parses.
    #[must_use]
    pub fn assigned_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.str_field("assigned_at")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Timestamp format written to `assigned_at`.
#[must_use]
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically take the first available instance of `task_id`, marking it
    /// unavailable with `assigned_at`. Returns the instance as it was claimed.
    async fn claim_available(
        &self,
        task_id: &str,
        assigned_at: DateTime<Utc>,
    ) -> Result<Option<StoredDocument>>;

    /// True when some instance has `field == value` and is available.
    async fn has_available(&self, field: &str, value: &str) -> Result<bool>;

    /// Set the `available` flag of existing instances. Fails if any id is unknown.
    async fn set_availability(&self, updates: &[(String, bool)]) -> Result<usize>;

    /// Every instance, optionally only those whose `field` equals the value.
    async fn list(&self, filter: Option<(&str, &Value)>) -> Result<Vec<StoredDocument>>;

    /// Delete every instance, returning how many were removed.
    async fn clear(&self) -> Result<usize>;

    /// Create or replace instances by id.
    async fn insert_many(&self, docs: Vec<(String, Fields)>) -> Result<usize>;
}

/// In-process store used for development and tests.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    docs: Mutex<BTreeMap<String, StoredDocument>>,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn claim_available(
        &self,
        task_id: &str,
        assigned_at: DateTime<Utc>,
    ) -> Result<Option<StoredDocument>> {
        let mut docs = self.docs.lock().await;
        let Some(doc) = docs
            .values_mut()
            .find(|d| d.str_field("task_id") == Some(task_id) && d.is_available())
        else {
            return Ok(None);
        };
        doc.fields.insert("available".to_string(), Value::Bool(false));
        doc.fields.insert(
            "assigned_at".to_string(),
            Value::String(format_timestamp(assigned_at)),
        );
        doc.update_time = Some(format_timestamp(Utc::now()));
        Ok(Some(doc.clone()))
    }

    async fn has_available(&self, field: &str, value: &str) -> Result<bool> {
        let docs = self.docs.lock().await;
        Ok(docs
            .values()
            .any(|d| d.str_field(field) == Some(value) && d.is_available()))
    }

    async fn set_availability(&self, updates: &[(String, bool)]) -> Result<usize> {
        let mut docs = self.docs.lock().await;
        if let Some((missing, _)) = updates.iter().find(|(id, _)| !docs.contains_key(id)) {
            return Err(anyhow!("No document to update: {missing}"));
        }
        for (id, available) in updates {
            if let Some(doc) = docs.get_mut(id) {
                doc.fields
                    .insert("available".to_string(), Value::Bool(*available));
            }
        }
        Ok(updates.len())
    }

    async fn list(&self, filter: Option<(&str, &Value)>) -> Result<Vec<StoredDocument>> {
        let docs = self.docs.lock().await;
        Ok(docs
            .values()
            .filter(|d| filter.is_none_or(|(field, value)| d.fields.get(field) == Some(value)))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<usize> {
        let mut docs = self.docs.lock().await;
        let count = docs.len();
        docs.clear();
        Ok(count)
    }

    async fn insert_many(&self, new_docs: Vec<(String, Fields)>) -> Result<usize> {
        let mut docs = self.docs.lock().await;
        let now = format_timestamp(Utc::now());
        let count = new_docs.len();
        for (id, fields) in new_docs {
            let mut doc = StoredDocument::new(&id, fields);
            doc.create_time = Some(now.clone());
            doc.update_time = Some(now.clone());
            docs.insert(id, doc);
        }
        Ok(count)
    }
}
