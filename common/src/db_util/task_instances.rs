#![allow(dead_code)]

use super::*;
use rand::seq::SliceRandom;

table! {
    task_instances (id) {
        id -> Integer,
        task_id -> Integer,
        instance_number -> Integer,
        pdf_url -> Text,
        is_assigned -> Bool,
        is_completed -> Bool,
        assigned_round -> Integer,
    }
}

#[derive(Queryable)]
#[diesel(table_name = task_instances)]
struct TaskInstancePrivate {
    id: i32,
    task_id: i32,
    instance_number: i32,
    pdf_url: String,
    is_assigned: bool,
    is_completed: bool,
    assigned_round: i32,
}

#[derive(Insertable)]
#[diesel(table_name = task_instances)]
struct TaskInstancePrivateNew<'a> {
    task_id: i32,
    instance_number: i32,
    pdf_url: &'a str,
}

fn private_to_public(p: TaskInstancePrivate) -> Result<TaskInstanceRecord, String> {
    use conversions::*;
    Ok(TaskInstanceRecord {
        id: i32_to_u32(p.id)?,
        task_id: i32_to_u32(p.task_id)?,
        instance_number: i32_to_u32(p.instance_number)?,
        pdf_url: p.pdf_url,
        is_assigned: p.is_assigned,
        is_completed: p.is_completed,
        assigned_round: i32_to_u32(p.assigned_round)?,
    })
}

enum Claim {
    UnknownTask,
    NoneAvailable,
    Claimed(TaskInstancePrivate, Vec<String>),
}

/// Hand out the next instance of a task for `round`.
///
/// The lowest-numbered instance that is either unassigned, or incomplete and
/// last assigned in an earlier round, is marked assigned inside an immediate
/// transaction so two callers never receive the same instance. At most
/// `RESPONSES_PER_TASK` response URLs are returned: extra responses are
/// sampled at random and missing ones are `None`.
pub fn assign_task_instance<R: Rng + ?Sized>(
    conn: &mut SqliteConnection,
    input_task_id: &str,
    input_occupation: &str,
    round: u32,
    rng: &mut R,
) -> Result<AssignmentOutcome, String> {
    let round = conversions::u32_to_i32(round)?;

    let claim = conn
        .immediate_transaction::<_, diesel::result::Error, _>(|conn| {
            use self::task_instances::dsl::*;

            let Some(task_row) = super::tasks::find_task_row(conn, input_task_id, input_occupation)?
            else {
                return Ok(Claim::UnknownTask);
            };

            let next = task_instances
                .filter(task_id.eq(task_row))
                .filter(
                    is_assigned
                        .eq(false)
                        .or(is_completed.eq(false).and(assigned_round.lt(round))),
                )
                .order(instance_number.asc())
                .first::<TaskInstancePrivate>(conn)
                .optional()?;
            let Some(mut instance) = next else {
                return Ok(Claim::NoneAvailable);
            };

            diesel::update(task_instances.filter(id.eq(instance.id)))
                .set((is_assigned.eq(true), assigned_round.eq(round)))
                .execute(conn)?;
            instance.is_assigned = true;
            instance.assigned_round = round;

            let urls = super::model_responses::response_urls(conn, instance.id)?;
            Ok(Claim::Claimed(instance, urls))
        })
        .map_err(|e| e.to_string())?;

    match claim {
        Claim::UnknownTask => Ok(AssignmentOutcome::UnknownTask),
        Claim::NoneAvailable => Ok(AssignmentOutcome::NoneAvailable),
        Claim::Claimed(instance, mut urls) => {
            if urls.len() > RESPONSES_PER_TASK {
                urls.shuffle(rng);
                urls.truncate(RESPONSES_PER_TASK);
            }
            let model_urls = std::array::from_fn(|i| urls.get(i).cloned());
            Ok(AssignmentOutcome::Assigned(Assignment {
                instance: private_to_public(instance)?,
                model_urls,
            }))
        }
    }
}

/// Insert the instance unless it exists, returning its row id either way.
pub(super) fn insert_or_get_instance(
    conn: &mut SqliteConnection,
    task_row: i32,
    number: i32,
    url: &str,
) -> QueryResult<i32> {
    use self::task_instances::dsl::*;

    diesel::insert_or_ignore_into(task_instances)
        .values(&TaskInstancePrivateNew {
            task_id: task_row,
            instance_number: number,
            pdf_url: url,
        })
        .execute(conn)?;

    task_instances
        .filter(task_id.eq(task_row))
        .filter(instance_number.eq(number))
        .select(id)
        .first::<i32>(conn)
}

/// Mark instances completed, but only those assigned in `round`.
/// Returns how many rows matched.
pub fn mark_completed(
    conn: &mut SqliteConnection,
    instance_ids: &[u32],
    round: u32,
) -> Result<usize, String> {
    use self::task_instances::dsl::*;

    let round = conversions::u32_to_i32(round)?;
    let row_ids = instance_ids
        .iter()
        .map(|i| conversions::u32_to_i32(*i))
        .collect::<Result<Vec<i32>, String>>()?;

    diesel::update(
        task_instances
            .filter(id.eq_any(row_ids))
            .filter(assigned_round.eq(round)),
    )
    .set(is_completed.eq(true))
    .execute(conn)
    .map_err(|e| e.to_string())
}

/// Clear assignments. With `retain_completion` completed instances keep both
/// their completion and assignment, otherwise every instance is reset.
pub fn reset_assignments(
    conn: &mut SqliteConnection,
    retain_completion: bool,
) -> Result<usize, String> {
    use self::task_instances::dsl::*;

    let result = if retain_completion {
        diesel::update(task_instances.filter(is_completed.eq(false)))
            .set((is_assigned.eq(false), assigned_round.eq(0)))
            .execute(conn)
    } else {
        diesel::update(task_instances)
            .set((
                is_assigned.eq(false),
                is_completed.eq(false),
                assigned_round.eq(0),
            ))
            .execute(conn)
    };
    result.map_err(|e| e.to_string())
}

pub(super) fn count_instances(conn: &mut SqliteConnection) -> QueryResult<(i64, i64, i64)> {
    use self::task_instances::dsl::*;

    let total = task_instances.count().get_result(conn)?;
    let assigned = task_instances
        .filter(is_assigned.eq(true))
        .count()
        .get_result(conn)?;
    let completed = task_instances
        .filter(is_completed.eq(true))
        .count()
        .get_result(conn)?;
    Ok((total, assigned, completed))
}

pub fn get_task_instance_by_id(
    conn: &mut SqliteConnection,
    row_id: u32,
) -> Result<TaskInstanceRecord, String> {
    use self::task_instances::dsl::*;

    let row_id = conversions::u32_to_i32(row_id)?;
    let result = task_instances
        .filter(id.eq(row_id))
        .first::<TaskInstancePrivate>(conn)
        .map_err(|e| e.to_string())?;
    private_to_public(result)
}
