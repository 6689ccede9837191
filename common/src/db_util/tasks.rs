#![allow(dead_code)]

use super::*;

table! {
    tasks (id) {
        id -> Integer,
        task_id -> Text,
        occupation -> Text,
    }
}

#[derive(Queryable)]
#[diesel(table_name = tasks)]
struct TaskPrivate {
    id: i32,
    task_id: String,
    occupation: String,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
struct TaskPrivateNew<'a> {
    task_id: &'a str,
    occupation: &'a str,
}

fn private_to_public(p: TaskPrivate) -> Result<TaskRecord, String> {
    use conversions::*;
    Ok(TaskRecord {
        id: i32_to_u32(p.id)?,
        task_id: p.task_id,
        occupation: p.occupation,
    })
}

/// Row id of the task with this external id and occupation.
pub(super) fn find_task_row(
    conn: &mut SqliteConnection,
    input_task_id: &str,
    input_occupation: &str,
) -> QueryResult<Option<i32>> {
    use self::tasks::dsl::*;

    tasks
        .filter(task_id.eq(input_task_id))
        .filter(occupation.eq(input_occupation))
        .select(id)
        .first::<i32>(conn)
        .optional()
}

/// Insert the task unless it exists, returning its row id either way.
pub(super) fn insert_or_get_task(
    conn: &mut SqliteConnection,
    input_task_id: &str,
    input_occupation: &str,
) -> QueryResult<i32> {
    use self::tasks::dsl::*;

    diesel::insert_or_ignore_into(tasks)
        .values(&TaskPrivateNew {
            task_id: input_task_id,
            occupation: input_occupation,
        })
        .execute(conn)?;

    tasks
        .filter(task_id.eq(input_task_id))
        .filter(occupation.eq(input_occupation))
        .select(id)
        .first::<i32>(conn)
}

pub(super) fn count_tasks(conn: &mut SqliteConnection) -> QueryResult<i64> {
    use self::tasks::dsl::*;

    tasks.count().get_result(conn)
}

pub fn get_task_by_id(conn: &mut SqliteConnection, row_id: u32) -> Result<TaskRecord, String> {
    use self::tasks::dsl::*;

    let row_id = conversions::u32_to_i32(row_id)?;
    let result = tasks
        .filter(id.eq(row_id))
        .first::<TaskPrivate>(conn)
        .map_err(|e| e.to_string())?;
    private_to_public(result)
}
