//! Interfaces between the assignment service and its SQLite database.

use super::*;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use rand::Rng;
use serde::Deserializer;

mod conversions;
mod model_responses;
mod task_instances;
mod tasks;

pub use model_responses::get_responses_for_instance;
pub use task_instances::{
    assign_task_instance, get_task_instance_by_id, mark_completed, reset_assignments,
};
pub use tasks::get_task_by_id;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
pub type SqlitePooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

pub const DEFAULT_DATABASE_URL: &str = "task_database.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    occupation TEXT NOT NULL,
    UNIQUE(task_id, occupation)
);
CREATE TABLE IF NOT EXISTS task_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    instance_number INTEGER NOT NULL,
    pdf_url TEXT NOT NULL,
    is_assigned BOOLEAN NOT NULL DEFAULT FALSE,
    is_completed BOOLEAN NOT NULL DEFAULT FALSE,
    assigned_round INTEGER NOT NULL DEFAULT 0,
    UNIQUE(task_id, instance_number)
);
CREATE TABLE IF NOT EXISTS model_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_instance_id INTEGER NOT NULL REFERENCES task_instances(id),
    model_number INTEGER NOT NULL,
    pdf_url TEXT NOT NULL,
    UNIQUE(task_instance_id, model_number)
);
CREATE INDEX IF NOT EXISTS idx_task_instances_next
    ON task_instances(task_id, is_assigned, is_completed, assigned_round);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: u32,
    pub task_id: String,
    pub occupation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInstanceRecord {
    pub id: u32,
    pub task_id: u32,
    pub instance_number: u32,
    pub pdf_url: String,
    pub is_assigned: bool,
    pub is_completed: bool,
    pub assigned_round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelResponseRecord {
    pub id: u32,
    pub task_instance_id: u32,
    pub model_number: u32,
    pub pdf_url: String,
}

/// An instance handed out by `assign_task_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub instance: TaskInstanceRecord,
    pub model_urls: [Option<String>; RESPONSES_PER_TASK],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    UnknownTask,
    NoneAvailable,
    Assigned(Assignment),
}

/// Accept ids written either as JSON strings or numbers.
fn deserialize_external_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadModelResponse {
    pub model_number: u32,
    pub pdf_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadInstance {
    pub instance_number: u32,
    pub pdf_url: String,
    #[serde(default)]
    pub model_responses: Vec<LoadModelResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadTask {
    #[serde(deserialize_with = "deserialize_external_id")]
    pub task_id: String,
    #[serde(deserialize_with = "deserialize_external_id")]
    pub occupation: String,
    #[serde(default)]
    pub instances: Vec<LoadInstance>,
}

/// Number of entries processed by `load_data`, including ones that already existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub tasks: usize,
    pub task_instances: usize,
    pub model_responses: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStatus {
    pub tasks: u64,
    pub task_instances: u64,
    pub model_responses: u64,
    pub assigned_instances: u64,
    pub completed_instances: u64,
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub fn get_database_pool(database_url: &str) -> Result<SqlitePool, String> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder()
        .connection_customizer(Box::new(SqlitePragmas))
        .build(manager)
        .map_err(|e| format!("Error creating pool for {database_url}: {e}"))
}

pub fn get_pooled_database_connection(pool: &SqlitePool) -> Result<SqlitePooledConnection, String> {
    pool.get().map_err(|e| e.to_string())
}

/// Create the tables if they do not exist yet.
pub fn initialize_schema(conn: &mut SqliteConnection) -> Result<(), String> {
    conn.batch_execute(SCHEMA).map_err(|e| e.to_string())
}

struct PreparedInstance<'a> {
    instance_number: i32,
    pdf_url: &'a str,
    responses: Vec<(i32, &'a str)>,
}

fn prepare_instance(instance: &LoadInstance) -> Result<PreparedInstance<'_>, String> {
    use conversions::*;
    Ok(PreparedInstance {
        instance_number: u32_to_i32(instance.instance_number)?,
        pdf_url: &instance.pdf_url,
        responses: instance
            .model_responses
            .iter()
            .map(|r| Ok((u32_to_i32(r.model_number)?, r.pdf_url.as_str())))
            .collect::<Result<_, String>>()?,
    })
}

/// Insert tasks, their instances and responses, ignoring rows that exist.
/// Everything is written in one transaction.
pub fn load_data(conn: &mut SqliteConnection, input: &[LoadTask]) -> Result<LoadSummary, String> {
    let prepared = input
        .iter()
        .map(|task| {
            let instances = task
                .instances
                .iter()
                .map(prepare_instance)
                .collect::<Result<Vec<_>, String>>()?;
            Ok((task, instances))
        })
        .collect::<Result<Vec<_>, String>>()?;

    conn.immediate_transaction::<_, diesel::result::Error, _>(|conn| {
        let mut summary = LoadSummary::default();
        for (task, instances) in &prepared {
            let task_row = tasks::insert_or_get_task(conn, &task.task_id, &task.occupation)?;
            summary.tasks += 1;
            for instance in instances {
                let instance_row = task_instances::insert_or_get_instance(
                    conn,
                    task_row,
                    instance.instance_number,
                    instance.pdf_url,
                )?;
                summary.task_instances += 1;
                for (number, url) in &instance.responses {
                    model_responses::insert_or_ignore_response(conn, instance_row, *number, url)?;
                    summary.model_responses += 1;
                }
            }
        }
        Ok(summary)
    })
    .map_err(|e| e.to_string())
}

pub fn get_status(conn: &mut SqliteConnection) -> Result<DatabaseStatus, String> {
    use conversions::*;

    let task_count = tasks::count_tasks(conn).map_err(|e| e.to_string())?;
    let response_count = model_responses::count_responses(conn).map_err(|e| e.to_string())?;
    let (total, assigned, completed) =
        task_instances::count_instances(conn).map_err(|e| e.to_string())?;

    Ok(DatabaseStatus {
        tasks: i64_to_u64(task_count)?,
        task_instances: i64_to_u64(total)?,
        model_responses: i64_to_u64(response_count)?,
        assigned_instances: i64_to_u64(assigned)?,
        completed_instances: i64_to_u64(completed)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let pool = get_database_pool(path.to_str().unwrap()).unwrap();
        let mut conn = get_pooled_database_connection(&pool).unwrap();
        initialize_schema(&mut conn).unwrap();
        (dir, pool)
    }

    fn sample_tasks(responses: u32) -> Vec<LoadTask> {
        let instances: Vec<_> = (1..=2)
            .map(|i| {
                json!({
                    "instance_number": i,
                    "pdf_url": format!("https://files/task1_{i}.pdf"),
                    "model_responses": (1..=responses)
                        .map(|m| {
                            json!({
                                "model_number": m,
                                "pdf_url": format!("https://files/task1_{i}_m{m}.pdf"),
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::from_value(json!([
            {"task_id": 1, "occupation": "Nurse", "instances": instances}
        ]))
        .unwrap()
    }

    fn assigned(outcome: AssignmentOutcome) -> Assignment {
        match outcome {
            AssignmentOutcome::Assigned(a) => a,
            other => panic!("expected an assignment, got {other:?}"),
        }
    }

    #[test_log::test]
    fn test_load_is_idempotent() {
        let (_dir, pool) = test_pool();
        let mut conn = get_pooled_database_connection(&pool).unwrap();

        let summary = load_data(&mut conn, &sample_tasks(5)).unwrap();
        assert_eq!(summary.tasks, 1);
        assert_eq!(summary.task_instances, 2);
        assert_eq!(summary.model_responses, 10);

        load_data(&mut conn, &sample_tasks(5)).unwrap();
        let status = get_status(&mut conn).unwrap();
        assert_eq!(status.tasks, 1);
        assert_eq!(status.task_instances, 2);
        assert_eq!(status.model_responses, 10);
        assert_eq!(status.assigned_instances, 0);

        let task = get_task_by_id(&mut conn, 1).unwrap();
        assert_eq!(task.task_id, "1");
        assert_eq!(get_responses_for_instance(&mut conn, 1).unwrap().len(), 5);
    }

    #[test_log::test]
    fn test_assignment_rounds() {
        let (_dir, pool) = test_pool();
        let mut conn = get_pooled_database_connection(&pool).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        load_data(&mut conn, &sample_tasks(5)).unwrap();

        let first = assigned(assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap());
        assert_eq!(first.instance.instance_number, 1);
        assert_eq!(first.instance.assigned_round, 1);
        assert_eq!(
            first.model_urls[0].as_deref(),
            Some("https://files/task1_1_m1.pdf")
        );

        let second = assigned(assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap());
        assert_eq!(second.instance.instance_number, 2);
        assert_eq!(
            assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap(),
            AssignmentOutcome::NoneAvailable
        );

        // completion only counts for the round the instance was handed out in
        assert_eq!(mark_completed(&mut conn, &[first.instance.id], 2).unwrap(), 0);
        assert_eq!(mark_completed(&mut conn, &[first.instance.id], 1).unwrap(), 1);

        // round 2 reissues the incomplete instance only
        let reissued =
            assigned(assign_task_instance(&mut conn, "1", "Nurse", 2, &mut rng).unwrap());
        assert_eq!(reissued.instance.instance_number, 2);
        assert_eq!(
            assign_task_instance(&mut conn, "1", "Nurse", 2, &mut rng).unwrap(),
            AssignmentOutcome::NoneAvailable
        );

        let status = get_status(&mut conn).unwrap();
        assert_eq!(status.assigned_instances, 2);
        assert_eq!(status.completed_instances, 1);
        let stored = get_task_instance_by_id(&mut conn, reissued.instance.id).unwrap();
        assert_eq!(stored.assigned_round, 2);
    }

    #[test_log::test]
    fn test_unknown_task() {
        let (_dir, pool) = test_pool();
        let mut conn = get_pooled_database_connection(&pool).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        load_data(&mut conn, &sample_tasks(5)).unwrap();

        assert_eq!(
            assign_task_instance(&mut conn, "1", "Chef", 1, &mut rng).unwrap(),
            AssignmentOutcome::UnknownTask
        );
    }

    #[test_log::test]
    fn test_response_padding_and_sampling() {
        let (_dir, pool) = test_pool();
        let mut conn = get_pooled_database_connection(&pool).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        load_data(&mut conn, &sample_tasks(3)).unwrap();
        let padded = assigned(assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap());
        assert!(padded.model_urls[..3].iter().all(Option::is_some));
        assert!(padded.model_urls[3..].iter().all(Option::is_none));

        let mut more = sample_tasks(8);
        more[0].occupation = "Chef".to_string();
        load_data(&mut conn, &more).unwrap();
        let sampled = assigned(assign_task_instance(&mut conn, "1", "Chef", 1, &mut rng).unwrap());
        let mut urls: Vec<String> = sampled.model_urls.iter().flatten().cloned().collect();
        assert_eq!(urls.len(), 5);
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 5);
        assert!(urls.iter().all(|u| u.starts_with("https://files/task1_1_m")));
    }

    #[test_log::test]
    fn test_reset_assignments() {
        let (_dir, pool) = test_pool();
        let mut conn = get_pooled_database_connection(&pool).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        load_data(&mut conn, &sample_tasks(5)).unwrap();

        let first = assigned(assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap());
        assign_task_instance(&mut conn, "1", "Nurse", 1, &mut rng).unwrap();
        mark_completed(&mut conn, &[first.instance.id], 1).unwrap();

        // only the incomplete instance is touched
        assert_eq!(reset_assignments(&mut conn, true).unwrap(), 1);
        let status = get_status(&mut conn).unwrap();
        assert_eq!(status.assigned_instances, 1);
        assert_eq!(status.completed_instances, 1);

        assert_eq!(reset_assignments(&mut conn, false).unwrap(), 2);
        let status = get_status(&mut conn).unwrap();
        assert_eq!(status.assigned_instances, 0);
        assert_eq!(status.completed_instances, 0);
    }
}
