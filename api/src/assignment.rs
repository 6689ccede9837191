//! Task assignment service backed by SQLite.
//!
//! Each task has numbered instances. A participant asking for a task gets the
//! next instance that is free in the current round, together with up to five
//! model response URLs.

use crate::helpers::{
    ApiError, ApiResult, CorsFairing, RequestTimingFairing, bad_request_error, default_catcher,
    internal_error, not_found, not_found_error, rocket_figment, unprocessable_entity,
};
use rocket::serde::json::{Json, Value, json};
use rocket::serde::{Deserialize, Serialize};
use rocket::{Build, Rocket, State};
use survey_common::db_util::{
    AssignmentOutcome, DatabaseStatus, LoadSummary, LoadTask, SqlitePool, SqlitePooledConnection,
    assign_task_instance, get_pooled_database_connection, get_status, load_data, mark_completed,
    reset_assignments,
};

/// Round used when a request does not name one.
pub const DEFAULT_ROUND: u32 = 1;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct CompletionRequest {
    pub completed_instances: Vec<u32>,
    pub round_id: u32,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct LoadRequest {
    pub tasks: Vec<LoadTask>,
}

#[derive(Debug, Deserialize)]
#[serde(crate = "rocket::serde")]
pub struct ResetRequest {
    #[serde(default = "default_true")]
    pub retain_completion: bool,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct UpdatedResponse {
    pub status: &'static str,
    pub updated_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct LoadedResponse {
    pub status: &'static str,
    pub loaded: LoadSummary,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ResetResponse {
    pub status: &'static str,
    pub reset_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct StatusResponse {
    pub status: &'static str,
    pub database: DatabaseStatus,
}

fn connection(pool: &SqlitePool) -> Result<SqlitePooledConnection, ApiError> {
    get_pooled_database_connection(pool).map_err(|e| {
        tracing::error!(error = %e, "Failed to get a database connection");
        internal_error("Database unavailable")
    })
}

fn database_error(action: &str, e: &str) -> ApiError {
    tracing::error!(error = %e, "Database error while {action}");
    internal_error(format!("Database error while {action}"))
}

#[get("/get_task?<task_id>&<occupation>&<round_id>")]
pub fn get_task(
    task_id: Option<String>,
    occupation: Option<String>,
    round_id: Option<u32>,
    pool: &State<SqlitePool>,
) -> ApiResult<Value> {
    let (Some(task_id), Some(occupation)) = (
        task_id.filter(|t| !t.is_empty()),
        occupation.filter(|o| !o.is_empty()),
    ) else {
        return Err(bad_request_error("Missing task_id or occupation parameter"));
    };
    let round = round_id.unwrap_or(DEFAULT_ROUND);

    let mut conn = connection(pool)?;
    let outcome = assign_task_instance(&mut conn, &task_id, &occupation, round, &mut rand::rng())
        .map_err(|e| database_error("assigning a task", &e))?;

    match outcome {
        AssignmentOutcome::UnknownTask => Err(not_found_error(format!(
            "Task {task_id} for occupation {occupation} not found"
        ))),
        AssignmentOutcome::NoneAvailable => {
            tracing::warn!(%task_id, %occupation, round, "No task instances available");
            Err(not_found_error("No available task instances"))
        }
        AssignmentOutcome::Assigned(assignment) => {
            tracing::info!(
                %task_id,
                %occupation,
                round,
                instance_id = assignment.instance.id,
                instance_number = assignment.instance.instance_number,
                "Assigned task instance"
            );
            let mut body = json!({ "task_instance_url": assignment.instance.pdf_url });
            for (i, url) in assignment.model_urls.iter().enumerate() {
                body[format!("model{}_url", i + 1)] = json!(url);
            }
            Ok(Json(body))
        }
    }
}

#[post("/update_completion", data = "<request>")]
pub fn update_completion(
    request: Result<Json<CompletionRequest>, rocket::serde::json::Error<'_>>,
    pool: &State<SqlitePool>,
) -> ApiResult<UpdatedResponse> {
    let request = request
        .map_err(|e| bad_request_error(format!("Missing required parameters: {e}")))?;
    let mut conn = connection(pool)?;
    let updated_count = mark_completed(&mut conn, &request.completed_instances, request.round_id)
        .map_err(|e| database_error("updating completion", &e))?;

    tracing::info!(
        requested = request.completed_instances.len(),
        updated_count,
        round = request.round_id,
        "Marked task instances completed"
    );
    Ok(Json(UpdatedResponse {
        status: "success",
        updated_count,
    }))
}

#[post("/load_data", data = "<request>")]
pub fn load_data_route(
    request: Result<Json<LoadRequest>, rocket::serde::json::Error<'_>>,
    pool: &State<SqlitePool>,
) -> ApiResult<LoadedResponse> {
    let request = request.map_err(|e| bad_request_error(format!("Invalid request: {e}")))?;
    let mut conn = connection(pool)?;
    let loaded =
        load_data(&mut conn, &request.tasks).map_err(|e| database_error("loading data", &e))?;

    tracing::info!(
        tasks = loaded.tasks,
        task_instances = loaded.task_instances,
        model_responses = loaded.model_responses,
        "Loaded task data"
    );
    Ok(Json(LoadedResponse {
        status: "success",
        loaded,
    }))
}

#[post("/reset_assignments", data = "<request>")]
pub fn reset_assignments_route(
    request: Option<Json<ResetRequest>>,
    pool: &State<SqlitePool>,
) -> ApiResult<ResetResponse> {
    let retain_completion = request.is_none_or(|r| r.retain_completion);
    let mut conn = connection(pool)?;
    let reset_count = reset_assignments(&mut conn, retain_completion)
        .map_err(|e| database_error("resetting assignments", &e))?;

    tracing::info!(reset_count, retain_completion, "Reset task assignments");
    Ok(Json(ResetResponse {
        status: "success",
        reset_count,
    }))
}

#[get("/status")]
pub fn status(pool: &State<SqlitePool>) -> ApiResult<StatusResponse> {
    let mut conn = connection(pool)?;
    let database = get_status(&mut conn).map_err(|e| database_error("reading status", &e))?;
    Ok(Json(StatusResponse {
        status: "running",
        database,
    }))
}

pub fn build_rocket(pool: SqlitePool) -> Rocket<Build> {
    rocket::custom(rocket_figment())
        .manage(pool)
        .mount(
            "/",
            routes![
                get_task,
                update_completion,
                load_data_route,
                reset_assignments_route,
                status
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
    use rocket::local::blocking::Client;
    use survey_common::db_util::{get_database_pool, initialize_schema};

    fn client() -> (tempfile::TempDir, Client) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let pool = get_database_pool(path.to_str().unwrap()).unwrap();
        initialize_schema(&mut get_pooled_database_connection(&pool).unwrap()).unwrap();
        let client = Client::tracked(build_rocket(pool)).unwrap();
        (dir, client)
    }

    fn load(client: &Client) {
        let body = json!({
            "tasks": [{
                "task_id": 7,
                "occupation": "Nurse",
                "instances": [
                    {
                        "instance_number": 1,
                        "pdf_url": "https://files/t7_1.pdf",
                        "model_responses": [
                            {"model_number": 1, "pdf_url": "https://files/t7_1_m1.pdf"},
                            {"model_number": 2, "pdf_url": "https://files/t7_1_m2.pdf"}
                        ]
                    },
                    {"instance_number": 2, "pdf_url": "https://files/t7_2.pdf"}
                ]
            }]
        });
        let response = client.post("/load_data").json(&body).dispatch();
        assert_eq!(response.status(), Status::Ok);
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["loaded"]["task_instances"], 2);
        assert_eq!(value["loaded"]["model_responses"], 2);
    }

    #[test_log::test]
    fn test_get_task_flow() {
        let (_dir, client) = client();
        load(&client);

        let response = client.get("/get_task?task_id=7&occupation=Nurse").dispatch();
        assert_eq!(response.status(), Status::Ok);
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["task_instance_url"], "https://files/t7_1.pdf");
        assert_eq!(value["model2_url"], "https://files/t7_1_m2.pdf");
        assert_eq!(value["model3_url"], Value::Null);

        let response = client.get("/get_task?task_id=7&occupation=Nurse").dispatch();
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["task_instance_url"], "https://files/t7_2.pdf");

        let response = client.get("/get_task?task_id=7&occupation=Nurse").dispatch();
        assert_eq!(response.status(), Status::NotFound);

        let response = client
            .post("/update_completion")
            .json(&json!({"completed_instances": [1], "round_id": 1}))
            .dispatch();
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["updated_count"], 1);

        // the next round only reissues the incomplete instance
        let response = client
            .get("/get_task?task_id=7&occupation=Nurse&round_id=2")
            .dispatch();
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["task_instance_url"], "https://files/t7_2.pdf");

        let value: Value = client.get("/status").dispatch().into_json().unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["database"]["assigned_instances"], 2);
        assert_eq!(value["database"]["completed_instances"], 1);
    }

    #[test_log::test]
    fn test_get_task_errors() {
        let (_dir, client) = client();
        load(&client);

        let response = client.get("/get_task?task_id=7").dispatch();
        assert_eq!(response.status(), Status::BadRequest);

        let response = client.get("/get_task?task_id=8&occupation=Nurse").dispatch();
        assert_eq!(response.status(), Status::NotFound);
        let value: Value = response.into_json().unwrap();
        assert_eq!(value["error"], "not_found");

        let response = client
            .post("/update_completion")
            .body("not json")
            .dispatch();
        assert_eq!(response.status(), Status::BadRequest);
    }

    #[test_log::test]
    fn test_update_completion_requires_fields() {
        let (_dir, client) = client();
        load(&client);
        client.get("/get_task?task_id=7&occupation=Nurse").dispatch();

        for body in [json!({}), json!({"completed_instances": [1]}), json!({"round_id": 1})] {
            let response = client.post("/update_completion").json(&body).dispatch();
            assert_eq!(response.status(), Status::BadRequest);
            let value: Value = response.into_json().unwrap();
            assert_eq!(value["error"], "bad_request");
        }

        let value: Value = client.get("/status").dispatch().into_json().unwrap();
        assert_eq!(value["database"]["completed_instances"], 0);
    }

    #[test_log::test]
    fn test_reset_assignments() {
        let (_dir, client) = client();
        load(&client);
        client.get("/get_task?task_id=7&occupation=Nurse").dispatch();
        client.get("/get_task?task_id=7&occupation=Nurse").dispatch();
        client
            .post("/update_completion")
            .json(&json!({"completed_instances": [1], "round_id": 1}))
            .dispatch();

        let value: Value = client
            .post("/reset_assignments")
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(value["reset_count"], 1);

        let value: Value = client
            .post("/reset_assignments")
            .json(&json!({"retain_completion": false}))
            .dispatch()
            .into_json()
            .unwrap();
        assert_eq!(value["reset_count"], 2);

        let value: Value = client.get("/status").dispatch().into_json().unwrap();
        assert_eq!(value["database"]["assigned_instances"], 0);
    }
}
