//! Task URL service backed by a document store.
//!
//! Every task instance is a document holding a task PDF URL and five response
//! URLs. Handing one out flips its `available` flag so nobody else gets it.

use crate::helpers::{
    ApiError, ApiResult, CorsFairing, RequestTimingFairing, bad_request_error, default_catcher,
    internal_error, not_found, not_found_error, rocket_figment, unprocessable_entity,
};
use chrono::{DateTime, Duration, Utc};
use rocket::form::Form;
use rocket::fs::TempFile;
use rocket::http::{ContentType, Header};
use rocket::serde::json::{Json, Value, json};
use rocket::serde::Serialize;
use rocket::tokio::io::AsyncReadExt;
use rocket::tokio::sync::Mutex;
use rocket::{Build, Rocket, State};
use survey_common::dashboard_stats::{
    DashboardStats, UnavailableOccupation, compute_dashboard, compute_unavailable_occupations,
};
use survey_common::task_store::{RESPONSE_URL_FIELDS, TaskStore};
use survey_common::task_transfer::{
    TransferFormat, export_rows, parse_documents, prepare_import, write_export,
};

/// Minutes the unavailable-occupation list is reused before recomputing.
pub const DEFAULT_CACHE_MINUTES: i64 = 15;

#[derive(Debug, Default)]
struct UnavailableCache {
    data: Vec<UnavailableOccupation>,
    last_updated: Option<DateTime<Utc>>,
}

pub struct UrlServiceState {
    store: Box<dyn TaskStore>,
    unavailable: Mutex<UnavailableCache>,
}

impl UrlServiceState {
    #[must_use]
    pub fn new(store: Box<dyn TaskStore>) -> Self {
        Self {
            store,
            unavailable: Mutex::new(UnavailableCache::default()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct UnavailableResponse {
    pub unavailable_occupations: Vec<UnavailableOccupation>,
    pub cached: bool,
    pub last_updated: String,
    pub cache_expires: String,
}

#[derive(FromForm)]
pub struct ImportForm<'r> {
    file: Option<TempFile<'r>>,
    format: Option<String>,
    clear_existing: Option<bool>,
}

/// A downloadable file.
#[derive(Responder)]
pub struct Attachment {
    body: Vec<u8>,
    content_type: ContentType,
    disposition: Header<'static>,
}

fn store_error(action: &str, e: &anyhow::Error) -> ApiError {
    tracing::error!(error = ?e, "Store error while {action}");
    internal_error(format!("Server error {action}"))
}

#[get("/get_task_urls?<task_id>")]
pub async fn get_task_urls(
    task_id: Option<String>,
    state: &State<UrlServiceState>,
) -> ApiResult<Value> {
    let Some(task_id) = task_id.filter(|t| !t.is_empty()) else {
        return Err(bad_request_error("Missing task_id parameter"));
    };

    let claimed = state
        .store
        .claim_available(&task_id, Utc::now())
        .await
        .map_err(|e| store_error("processing request", &e))?;
    let Some(doc) = claimed else {
        tracing::warn!(%task_id, "No available task instances");
        return Err(not_found_error(format!(
            "No available task instances for task ID: {task_id}"
        )));
    };

    let response_urls: Vec<Value> = RESPONSE_URL_FIELDS
        .iter()
        .map(|f| doc.fields.get(*f).cloned().unwrap_or(Value::Null))
        .collect();

    match state.store.has_available("task_id", &task_id).await {
        Ok(false) => tracing::info!(%task_id, "Task has no more available instances"),
        Ok(true) => {}
        Err(e) => tracing::warn!(%task_id, error = ?e, "Could not check remaining instances"),
    }

    tracing::info!(%task_id, task_instance_id = %doc.id, "Handed out task instance");
    Ok(Json(json!({
        "task_url": doc.fields.get("task_url"),
        "response_urls": response_urls,
        "task_instance_id": doc.id,
    })))
}

/// Pull `(id, available)` pairs out of the request, skipping incomplete items.
fn availability_updates(body: &Value) -> Option<Vec<(String, bool)>> {
    let items = body.get("task_instances")?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| {
                let id = match item.get("task_instance_id")? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                let available = item.get("available")?.as_bool()?;
                Some((id, available))
            })
            .collect(),
    )
}

#[post("/update_task_availability", data = "<body>")]
pub async fn update_task_availability(
    body: Result<Json<Value>, rocket::serde::json::Error<'_>>,
    state: &State<UrlServiceState>,
) -> ApiResult<Value> {
    let updates = body
        .ok()
        .and_then(|b| availability_updates(&b))
        .ok_or_else(|| bad_request_error("Invalid request format"))?;

    let updated_count = if updates.is_empty() {
        0
    } else {
        state
            .store
            .set_availability(&updates)
            .await
            .map_err(|e| store_error("updating task availability", &e))?
    };

    tracing::info!(updated_count, "Updated task availability");
    Ok(Json(json!({ "status": "success", "updated_count": updated_count })))
}

#[get("/check_occupation_status?<occupation_id>")]
pub async fn check_occupation_status(
    occupation_id: Option<String>,
    state: &State<UrlServiceState>,
) -> ApiResult<Value> {
    let Some(occupation_id) = occupation_id.filter(|o| !o.is_empty()) else {
        return Err(bad_request_error("Missing occupation_id parameter"));
    };
    let has_available_tasks = state
        .store
        .has_available("occupation_id", &occupation_id)
        .await
        .map_err(|e| store_error("checking occupation status", &e))?;
    Ok(Json(json!({ "has_available_tasks": has_available_tasks })))
}

fn sorted_occupations(data: &[UnavailableOccupation], sort: &str) -> Vec<UnavailableOccupation> {
    let mut list = data.to_vec();
    if sort == "alphabetical" {
        list.sort_by(|a, b| a.occupation_id.cmp(&b.occupation_id));
    }
    list
}

#[get("/list_unavailable_occupations?<force_refresh>&<cache_duration>&<sort>")]
pub async fn list_unavailable_occupations(
    force_refresh: Option<bool>,
    cache_duration: Option<i64>,
    sort: Option<String>,
    state: &State<UrlServiceState>,
) -> ApiResult<UnavailableResponse> {
    let cache_minutes = Duration::minutes(cache_duration.unwrap_or(DEFAULT_CACHE_MINUTES));
    let sort = sort.unwrap_or_default().to_ascii_lowercase();
    let now = Utc::now();

    let mut cache = state.unavailable.lock().await;
    if let Some(last_updated) = cache.last_updated {
        let fresh = now - last_updated <= cache_minutes;
        if fresh && !force_refresh.unwrap_or(false) && !cache.data.is_empty() {
            return Ok(Json(UnavailableResponse {
                unavailable_occupations: sorted_occupations(&cache.data, &sort),
                cached: true,
                last_updated: last_updated.to_rfc3339(),
                cache_expires: (last_updated + cache_minutes).to_rfc3339(),
            }));
        }
    }

    tracing::info!("Refreshing unavailable occupations cache");
    let docs = state
        .store
        .list(None)
        .await
        .map_err(|e| store_error("listing unavailable occupations", &e))?;
    cache.data = compute_unavailable_occupations(&docs, now);
    cache.last_updated = Some(now);

    Ok(Json(UnavailableResponse {
        unavailable_occupations: sorted_occupations(&cache.data, &sort),
        cached: false,
        last_updated: now.to_rfc3339(),
        cache_expires: (now + cache_minutes).to_rfc3339(),
    }))
}

async fn read_upload(file: &TempFile<'_>) -> std::io::Result<String> {
    let mut text = String::new();
    let mut reader = std::pin::pin!(file.open().await?);
    reader.read_to_string(&mut text).await?;
    Ok(text)
}

#[post("/import_data", data = "<form>")]
pub async fn import_data(
    form: Form<ImportForm<'_>>,
    state: &State<UrlServiceState>,
) -> ApiResult<Value> {
    let Some(file) = form.file.as_ref() else {
        return Err(bad_request_error("No file provided"));
    };
    if file.len() == 0 {
        return Err(bad_request_error("No file selected"));
    }
    let format: TransferFormat = form
        .format
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|e: anyhow::Error| bad_request_error(e.to_string()))?;
    let clear_existing = form.clear_existing.unwrap_or(false);

    let text = read_upload(file).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read upload");
        internal_error("Error reading uploaded file")
    })?;
    let docs = parse_documents(&text, format)
        .map(prepare_import)
        .map_err(|e| bad_request_error(format!("Error importing data: {e:#}")))?;

    if clear_existing {
        let removed = state
            .store
            .clear()
            .await
            .map_err(|e| store_error("clearing existing data", &e))?;
        tracing::info!(removed, "Cleared existing data");
    }
    let imported_count = state
        .store
        .insert_many(docs)
        .await
        .map_err(|e| store_error("importing data", &e))?;

    tracing::info!(imported_count, %format, clear_existing, "Imported task data");
    Ok(Json(json!({
        "status": "success",
        "imported_count": imported_count,
        "cleared_existing": clear_existing,
    })))
}

#[get("/export_data?<format>&<filename>&<include_metadata>&<filter_field>&<filter_value>")]
pub async fn export_data(
    format: Option<String>,
    filename: Option<String>,
    include_metadata: Option<bool>,
    filter_field: Option<String>,
    filter_value: Option<String>,
    state: &State<UrlServiceState>,
) -> Result<Attachment, ApiError> {
    let format: TransferFormat = format
        .as_deref()
        .unwrap_or("csv")
        .parse()
        .map_err(|e: anyhow::Error| bad_request_error(e.to_string()))?;

    let filter = match (filter_field.filter(|f| !f.is_empty()), filter_value) {
        (Some(field), Some(value)) => Some((field, Value::String(value))),
        (Some(_), None) => {
            return Err(bad_request_error(
                "filter_value is required when filter_field is provided",
            ));
        }
        (None, _) => None,
    };

    let docs = state
        .store
        .list(filter.as_ref().map(|(f, v)| (f.as_str(), v)))
        .await
        .map_err(|e| store_error("exporting data", &e))?;
    let rows = export_rows(&docs, include_metadata.unwrap_or(true));
    let body = write_export(&rows, format).map_err(|e| {
        tracing::error!(error = ?e, "Failed to render export");
        internal_error("Error exporting data")
    })?;

    let filename = filename.filter(|f| !f.is_empty()).unwrap_or_else(|| {
        format!(
            "task_data_export_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            format.extension()
        )
    });
    tracing::info!(rows = rows.len(), %filename, "Exported task data");

    let content_type = match format {
        TransferFormat::Csv => ContentType::CSV,
        TransferFormat::Json => ContentType::JSON,
    };
    Ok(Attachment {
        body,
        content_type,
        disposition: Header::new(
            "Content-Disposition",
            format!("attachment; filename=\"{filename}\""),
        ),
    })
}

#[get("/dashboard")]
pub async fn dashboard(state: &State<UrlServiceState>) -> ApiResult<DashboardStats> {
    let docs = state
        .store
        .list(None)
        .await
        .map_err(|e| store_error("generating dashboard", &e))?;
    Ok(Json(compute_dashboard(&docs, Utc::now())))
}

pub fn build_rocket(store: Box<dyn TaskStore>) -> Rocket<Build> {
    rocket::custom(rocket_figment())
        .manage(UrlServiceState::new(store))
        .mount(
            "/",
            routes![
                get_task_urls,
                update_task_availability,
                check_occupation_status,
                list_unavailable_occupations,
                import_data,
                export_data,
                dashboard
            ],
        )
        .register("/", catchers![not_found, unprocessable_entity, default_catcher])
        .attach(RequestTimingFairing)
        .attach(CorsFairing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::Status;
    use rocket::local::asynchronous::Client;
    use survey_common::task_store::MemoryTaskStore;

    const CSV: &str = "task_instance_id,task_id,occupation_id,task_url,response_url_1\n\
        i1,task_001_01_1,occupation_001,https://x/t1.pdf,https://x/r1.pdf\n\
        i2,task_001_01_1,occupation_001,https://x/t2.pdf,\n\
        i3,task_002_01_1,occupation_002,https://x/t3.pdf,\n";

    fn multipart(fields: &[(&str, &str)], file: Option<&str>) -> String {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--BOUNDARY\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        if let Some(content) = file {
            body.push_str(&format!(
                "--BOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"data.csv\"\r\nContent-Type: text/csv\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str("--BOUNDARY--\r\n");
        body
    }

    fn form_type() -> ContentType {
        ContentType::new("multipart", "form-data").with_params(("boundary", "BOUNDARY"))
    }

    async fn seeded_client() -> Client {
        let client = Client::tracked(build_rocket(Box::new(MemoryTaskStore::new())))
            .await
            .unwrap();
        let response = client
            .post("/import_data")
            .header(form_type())
            .body(multipart(&[("format", "csv")], Some(CSV)))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let value: Value = response.into_json().await.unwrap();
        assert_eq!(value["imported_count"], 3);
        assert_eq!(value["cleared_existing"], false);
        client
    }

    #[test_log::test(rocket::async_test)]
    async fn test_get_task_urls_until_exhausted() {
        let client = seeded_client().await;

        let response = client.get("/get_task_urls?task_id=task_001_01_1").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let value: Value = response.into_json().await.unwrap();
        assert_eq!(value["task_instance_id"], "i1");
        assert_eq!(value["task_url"], "https://x/t1.pdf");
        assert_eq!(value["response_urls"][0], "https://x/r1.pdf");
        assert_eq!(value["response_urls"].as_array().unwrap().len(), 5);

        let value: Value = client
            .get("/get_task_urls?task_id=task_001_01_1")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["task_instance_id"], "i2");
        assert_eq!(value["response_urls"][0], Value::Null);

        let response = client.get("/get_task_urls?task_id=task_001_01_1").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        let response = client.get("/get_task_urls").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);

        let value: Value = client
            .get("/check_occupation_status?occupation_id=occupation_001")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["has_available_tasks"], false);
    }

    #[test_log::test(rocket::async_test)]
    async fn test_update_availability() {
        let client = seeded_client().await;
        client.get("/get_task_urls?task_id=task_002_01_1").dispatch().await;

        let response = client
            .post("/update_task_availability")
            .json(&json!({"task_instances": [
                {"task_instance_id": "i3", "available": true},
                {"task_instance_id": "i1"}
            ]}))
            .dispatch()
            .await;
        let value: Value = response.into_json().await.unwrap();
        assert_eq!(value["updated_count"], 1);

        let value: Value = client
            .get("/check_occupation_status?occupation_id=occupation_002")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["has_available_tasks"], true);

        let response = client
            .post("/update_task_availability")
            .json(&json!({"instances": []}))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[test_log::test(rocket::async_test)]
    async fn test_unavailable_occupations_cache() {
        let client = seeded_client().await;
        client.get("/get_task_urls?task_id=task_002_01_1").dispatch().await;

        let value: Value = client
            .get("/list_unavailable_occupations")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["cached"], false);
        assert_eq!(
            value["unavailable_occupations"][0]["occupation_id"],
            "occupation_002"
        );

        let value: Value = client
            .get("/list_unavailable_occupations?sort=alphabetical")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["cached"], true);

        let value: Value = client
            .get("/list_unavailable_occupations?force_refresh=true")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(value["cached"], false);
    }

    #[test_log::test(rocket::async_test)]
    async fn test_import_rejects_bad_input() {
        let client = seeded_client().await;

        let response = client
            .post("/import_data")
            .header(form_type())
            .body(multipart(&[("format", "xml")], Some(CSV)))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post("/import_data")
            .header(form_type())
            .body(multipart(&[("format", "csv")], None))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        // clearing replaces the previous contents
        let response = client
            .post("/import_data")
            .header(form_type())
            .body(multipart(
                &[("format", "json"), ("clear_existing", "true")],
                Some(r#"[{"task_id": "t9", "occupation_id": "o9"}]"#),
            ))
            .dispatch()
            .await;
        let value: Value = response.into_json().await.unwrap();
        assert_eq!(value["cleared_existing"], true);

        let value: Value = client.get("/dashboard").dispatch().await.into_json().await.unwrap();
        assert_eq!(value["total_tasks"], 1);
        assert_eq!(value["available_tasks"], 1);
    }

    #[test_log::test(rocket::async_test)]
    async fn test_export_data() {
        let client = seeded_client().await;

        let response = client
            .get("/export_data?format=json&filter_field=occupation_id&filter_value=occupation_001&filename=out.json")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), Some(ContentType::JSON));
        assert_eq!(
            response.headers().get_one("Content-Disposition"),
            Some("attachment; filename=\"out.json\"")
        );
        let value: Value = response.into_json().await.unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert!(value[0]["doc_id"].is_string());

        let response = client.get("/export_data?include_metadata=false").dispatch().await;
        assert_eq!(response.content_type(), Some(ContentType::CSV));
        let text = response.into_string().await.unwrap();
        assert!(!text.contains("doc_id"));
        assert_eq!(text.lines().count(), 4);

        let response = client.get("/export_data?filter_field=task_id").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
    }
}
