//! Task instances stored in a Firestore collection, through the REST API.

use crate::client_api::{build_http_client, check_status, json_or_empty, retry_request};
use crate::task_store::{
    DELETE_BATCH_SIZE, Fields, StoredDocument, TaskStore, WRITE_BATCH_SIZE, format_timestamp,
};
use crate::RetryPolicy;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};

pub const FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_DATABASE: &str = "(default)";
pub const DEFAULT_COLLECTION: &str = "task_instances";

/// How many times a claim is retried when another writer got there first.
const CLAIM_ATTEMPTS: u32 = 5;

const LIST_PAGE_SIZE: usize = 300;

/// Encode a JSON value as a Firestore `Value`.
#[must_use]
pub fn to_firestore_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or(0.0) }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(to_firestore_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Decode a Firestore `Value` into plain JSON. Timestamps become RFC 3339 strings.
#[must_use]
pub fn from_firestore_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or(false)),
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| inner.as_i64())
            .map_or(Value::Null, Value::from),
        "doubleValue" => inner.as_f64().map_or(Value::Null, Value::from),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner["values"]
                .as_array()
                .map(|values| values.iter().map(from_firestore_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(decode_fields(&inner["fields"])),
        "geoPointValue" => inner.clone(),
        _ => Value::Null,
    }
}

#[must_use]
pub fn encode_fields(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), to_firestore_value(v)))
            .collect(),
    )
}

#[must_use]
pub fn decode_fields(fields: &Value) -> Fields {
    fields
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), from_firestore_value(v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Turn a Firestore `Document` resource into a stored document.
///
/// # Errors
///
/// Returns an error if the resource has no name.
pub fn decode_document(doc: &Value) -> Result<StoredDocument> {
    let name = doc["name"]
        .as_str()
        .ok_or_else(|| anyhow!("Firestore document has no name"))?;
    let id = name.rsplit('/').next().unwrap_or(name);
    Ok(StoredDocument {
        id: id.to_string(),
        fields: decode_fields(&doc["fields"]),
        create_time: doc["createTime"].as_str().map(str::to_string),
        update_time: doc["updateTime"].as_str().map(str::to_string),
    })
}

fn field_equals(field: &str, value: Value) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": "EQUAL",
            "value": to_firestore_value(&value),
        }
    })
}

fn and_filter(filters: Vec<Value>) -> Value {
    json!({ "compositeFilter": { "op": "AND", "filters": filters } })
}

/// Connection settings for a Firestore database.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    /// Usually `FIRESTORE_BASE_URL`; an emulator URL such as `http://localhost:8080/v1` also works.
    pub base_url: String,
    /// OAuth access token. The emulator does not need one.
    pub access_token: Option<String>,
}

pub struct FirestoreClient {
    client: Client,
    /// `projects/<p>/databases/<d>/documents`
    documents_path: String,
    base_url: String,
    access_token: Option<String>,
    policy: RetryPolicy,
}

impl FirestoreClient {
    /// # Errors
    ///
    /// Returns an error if the project id is missing.
    pub fn new(config: &FirestoreConfig) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            bail!("Firestore project id is not set");
        }
        let database = if config.database.is_empty() {
            DEFAULT_DATABASE
        } else {
            config.database.as_str()
        };
        Ok(Self {
            client: build_http_client()?,
            documents_path: format!(
                "projects/{}/databases/{database}/documents",
                config.project_id
            ),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
            policy: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.documents_path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.access_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("Access token contains invalid header characters")?,
            );
        }
        Ok(headers)
    }

    /// Send a request and hand back the status with the decoded body,
    /// without treating 4xx as an error.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        params: &[(&str, String)],
    ) -> Result<(StatusCode, Value)> {
        let headers = self.headers()?;
        debug!("{method} {url}");
        retry_request(
            || {
                let mut req = self
                    .client
                    .request(method.clone(), url)
                    .headers(headers.clone())
                    .query(params);
                if let Some(body) = body {
                    req = req.json(body);
                }
                req.send()
            },
            |response| async move {
                let status = response.status();
                if status.is_client_error() {
                    return Ok((status, json_or_empty(response).await.unwrap_or_default()));
                }
                let response = check_status(response).await?;
                Ok((status, json_or_empty(response).await?))
            },
            self.policy,
        )
        .await
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let (status, value) = self.send(method, url, body, params).await?;
        if !status.is_success() {
            bail!("Firestore returned {status}: {value}");
        }
        Ok(value)
    }

    /// Run a structured query against the database root.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is rejected.
    pub async fn run_query(&self, structured_query: Value) -> Result<Vec<StoredDocument>> {
        let url = format!("{}/{}:runQuery", self.base_url, self.documents_path);
        let body = json!({ "structuredQuery": structured_query });
        let value = self.call(Method::POST, &url, Some(&body), &[]).await?;
        value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get("document").is_some())
                    .map(|row| decode_document(&row["document"]))
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Apply writes atomically. Returns the status and body so callers can
    /// recognise failed preconditions.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures and server errors.
    pub async fn commit_raw(&self, writes: Vec<Value>) -> Result<(StatusCode, Value)> {
        let url = format!("{}/{}:commit", self.base_url, self.documents_path);
        let body = json!({ "writes": writes });
        self.send(Method::POST, &url, Some(&body), &[]).await
    }

    /// # Errors
    ///
    /// Returns an error if the commit is rejected.
    pub async fn commit(&self, writes: Vec<Value>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let (status, value) = self.commit_raw(writes).await?;
        if !status.is_success() {
            bail!("Firestore commit failed ({status}): {value}");
        }
        Ok(())
    }

    /// Every document in a collection, following page tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be fetched.
    pub async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>> {
        let url = format!("{}/{}/{collection}", self.base_url, self.documents_path);
        let mut docs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![("pageSize", LIST_PAGE_SIZE.to_string())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page = self.call(Method::GET, &url, None, &params).await?;
            if let Some(items) = page["documents"].as_array() {
                for item in items {
                    docs.push(decode_document(item)?);
                }
            }
            match page["nextPageToken"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(docs)
    }
}

fn is_contention(status: StatusCode, body: &Value) -> bool {
    let error_status = body["error"]["status"].as_str().unwrap_or_default();
    status == StatusCode::CONFLICT
        || error_status == "FAILED_PRECONDITION"
        || error_status == "ABORTED"
}

/// A `TaskStore` backed by one Firestore collection.
pub struct FirestoreTaskStore {
    client: FirestoreClient,
    collection: String,
}

impl FirestoreTaskStore {
    #[must_use]
    pub fn new(client: FirestoreClient, collection: &str) -> Self {
        Self {
            client,
            collection: collection.to_string(),
        }
    }

    fn query(&self, filter: Option<Value>, limit: Option<usize>) -> Value {
        let mut query = json!({ "from": [{ "collectionId": self.collection }] });
        if let Some(filter) = filter {
            query["where"] = filter;
        }
        if let Some(limit) = limit {
            query["limit"] = json!(limit);
        }
        query
    }

    fn available_query(&self, field: &str, value: &str) -> Value {
        self.query(
            Some(and_filter(vec![
                field_equals(field, json!(value)),
                field_equals("available", json!(true)),
            ])),
            Some(1),
        )
    }
}

#[async_trait]
impl TaskStore for FirestoreTaskStore {
    async fn claim_available(
        &self,
        task_id: &str,
        assigned_at: DateTime<Utc>,
    ) -> Result<Option<StoredDocument>> {
        let timestamp = format_timestamp(assigned_at);
        for attempt in 1..=CLAIM_ATTEMPTS {
            let found = self
                .client
                .run_query(self.available_query("task_id", task_id))
                .await?;
            let Some(mut doc) = found.into_iter().next() else {
                return Ok(None);
            };
            let Some(update_time) = doc.update_time.clone() else {
                bail!("Firestore document {} has no updateTime", doc.id);
            };

            let write = json!({
                "update": {
                    "name": self.client.document_name(&self.collection, &doc.id),
                    "fields": {
                        "available": { "booleanValue": false },
                        "assigned_at": { "timestampValue": timestamp },
                    },
                },
                "updateMask": { "fieldPaths": ["available", "assigned_at"] },
                "currentDocument": { "updateTime": update_time },
            });
            let (status, body) = self.client.commit_raw(vec![write]).await?;
            if status.is_success() {
                doc.fields.insert("available".to_string(), json!(false));
                doc.fields
                    .insert("assigned_at".to_string(), json!(timestamp));
                return Ok(Some(doc));
            }
            if !is_contention(status, &body) {
                bail!("Firestore claim failed ({status}): {body}");
            }
            warn!(
                "Instance {} of {task_id} was claimed concurrently, retrying (attempt {attempt}/{CLAIM_ATTEMPTS})",
                doc.id
            );
        }
        bail!("Could not claim an instance of {task_id} after {CLAIM_ATTEMPTS} attempts")
    }

    async fn has_available(&self, field: &str, value: &str) -> Result<bool> {
        let found = self
            .client
            .run_query(self.available_query(field, value))
            .await?;
        Ok(!found.is_empty())
    }

    async fn set_availability(&self, updates: &[(String, bool)]) -> Result<usize> {
        for chunk in updates.chunks(WRITE_BATCH_SIZE) {
            let writes = chunk
                .iter()
                .map(|(id, available)| {
                    json!({
                        "update": {
                            "name": self.client.document_name(&self.collection, id),
                            "fields": { "available": { "booleanValue": available } },
                        },
                        "updateMask": { "fieldPaths": ["available"] },
                        "currentDocument": { "exists": true },
                    })
                })
                .collect();
            self.client.commit(writes).await?;
        }
        Ok(updates.len())
    }

    async fn list(&self, filter: Option<(&str, &Value)>) -> Result<Vec<StoredDocument>> {
        match filter {
            Some((field, value)) => {
                self.client
                    .run_query(self.query(Some(field_equals(field, value.clone())), None))
                    .await
            }
            None => self.client.list_documents(&self.collection).await,
        }
    }

    async fn clear(&self) -> Result<usize> {
        let docs = self.client.list_documents(&self.collection).await?;
        for chunk in docs.chunks(DELETE_BATCH_SIZE) {
            let writes = chunk
                .iter()
                .map(|doc| {
                    json!({ "delete": self.client.document_name(&self.collection, &doc.id) })
                })
                .collect();
            self.client.commit(writes).await?;
        }
        Ok(docs.len())
    }

    async fn insert_many(&self, docs: Vec<(String, Fields)>) -> Result<usize> {
        for chunk in docs.chunks(WRITE_BATCH_SIZE) {
            let writes = chunk
                .iter()
                .map(|(id, fields)| {
                    json!({
                        "update": {
                            "name": self.client.document_name(&self.collection, id),
                            "fields": encode_fields(fields),
                        }
                    })
                })
                .collect();
            self.client.commit(writes).await?;
        }
        Ok(docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCS: &str = "/v1/projects/demo/databases/(default)/documents";

    fn store_for(server: &MockServer) -> FirestoreTaskStore {
        let client = FirestoreClient::new(&FirestoreConfig {
            project_id: "demo".to_string(),
            database: String::new(),
            base_url: format!("{}/v1", server.uri()),
            access_token: None,
        })
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        });
        FirestoreTaskStore::new(client, DEFAULT_COLLECTION)
    }

    fn remote_doc(id: &str, update_time: &str) -> Value {
        json!({
            "name": format!("projects/demo/databases/(default)/documents/task_instances/{id}"),
            "fields": {
                "task_id": {"stringValue": "t1"},
                "available": {"booleanValue": true},
                "task_url": {"stringValue": "https://x/t1.pdf"},
            },
            "createTime": "2025-01-01T00:00:00Z",
            "updateTime": update_time,
        })
    }

    #[test]
    fn test_value_codec() {
        let original = json!({
            "s": "x",
            "i": 42,
            "f": 1.5,
            "b": true,
            "n": null,
            "a": [1, "two"],
            "m": {"k": "v"},
        });
        let encoded = encode_fields(original.as_object().unwrap());
        assert_eq!(encoded["i"], json!({"integerValue": "42"}));
        assert_eq!(encoded["f"], json!({"doubleValue": 1.5}));
        assert_eq!(
            Value::Object(decode_fields(&encoded)),
            original
        );

        assert_eq!(
            from_firestore_value(&json!({"timestampValue": "2025-05-01T12:00:00Z"})),
            json!("2025-05-01T12:00:00Z")
        );
    }

    #[test]
    fn test_decode_document() {
        let doc = decode_document(&remote_doc("abc", "2025-01-02T00:00:00Z")).unwrap();
        assert_eq!(doc.id, "abc");
        assert_eq!(doc.str_field("task_url"), Some("https://x/t1.pdf"));
        assert_eq!(doc.update_time.as_deref(), Some("2025-01-02T00:00:00Z"));
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_retries_on_contention() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:runQuery")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"document": remote_doc("inst1", "2025-01-02T00:00:00Z"), "readTime": "2025-01-02T00:00:01Z"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:commit")))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 400, "status": "FAILED_PRECONDITION", "message": "stale"}
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:commit")))
            .and(body_partial_json(json!({
                "writes": [{"currentDocument": {"updateTime": "2025-01-02T00:00:00Z"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"writeResults": [{}]})))
            .mount(&server)
            .await;

        let claimed = store_for(&server)
            .claim_available("t1", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "inst1");
        assert!(!claimed.is_available());
        assert!(claimed.assigned_at().is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_none_available() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:runQuery")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"readTime": "2025-01-02T00:00:01Z"}])),
            )
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(store.claim_available("t1", Utc::now()).await.unwrap().is_none());
        assert!(!store.has_available("occupation_id", "o1").await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_list_follows_pages_and_clear_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{DOCS}/task_instances")))
            .and(wiremock::matchers::query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [remote_doc("b", "2025-01-02T00:00:00Z")]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{DOCS}/task_instances")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [remote_doc("a", "2025-01-02T00:00:00Z")],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:commit")))
            .and(body_partial_json(json!({"writes": [
                {"delete": "projects/demo/databases/(default)/documents/task_instances/a"},
                {"delete": "projects/demo/databases/(default)/documents/task_instances/b"}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        let ids: Vec<_> = store
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.clear().await.unwrap(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_set_availability_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{DOCS}:commit")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "status": "NOT_FOUND"}
            })))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(
            store
                .set_availability(&[("missing".to_string(), false)])
                .await
                .is_err()
        );
    }
}
