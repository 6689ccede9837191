#![allow(dead_code)]

use super::*;

table! {
    model_responses (id) {
        id -> Integer,
        task_instance_id -> Integer,
        model_number -> Integer,
        pdf_url -> Text,
    }
}

#[derive(Queryable)]
#[diesel(table_name = model_responses)]
struct ModelResponsePrivate {
    id: i32,
    task_instance_id: i32,
    model_number: i32,
    pdf_url: String,
}

#[derive(Insertable)]
#[diesel(table_name = model_responses)]
struct ModelResponsePrivateNew<'a> {
    task_instance_id: i32,
    model_number: i32,
    pdf_url: &'a str,
}

fn private_to_public(p: ModelResponsePrivate) -> Result<ModelResponseRecord, String> {
    use conversions::*;
    Ok(ModelResponseRecord {
        id: i32_to_u32(p.id)?,
        task_instance_id: i32_to_u32(p.task_instance_id)?,
        model_number: i32_to_u32(p.model_number)?,
        pdf_url: p.pdf_url,
    })
}

/// Returns 1 if the row was inserted, 0 if it already existed.
pub(super) fn insert_or_ignore_response(
    conn: &mut SqliteConnection,
    instance_row: i32,
    number: i32,
    url: &str,
) -> QueryResult<usize> {
    use self::model_responses::dsl::*;

    diesel::insert_or_ignore_into(model_responses)
        .values(&ModelResponsePrivateNew {
            task_instance_id: instance_row,
            model_number: number,
            pdf_url: url,
        })
        .execute(conn)
}

/// Response URLs of one instance by model number.
pub(super) fn response_urls(
    conn: &mut SqliteConnection,
    instance_row: i32,
) -> QueryResult<Vec<String>> {
    use self::model_responses::dsl::*;

    model_responses
        .filter(task_instance_id.eq(instance_row))
        .order(model_number.asc())
        .select(pdf_url)
        .load::<String>(conn)
}

pub(super) fn count_responses(conn: &mut SqliteConnection) -> QueryResult<i64> {
    use self::model_responses::dsl::*;

    model_responses.count().get_result(conn)
}

pub fn get_responses_for_instance(
    conn: &mut SqliteConnection,
    instance_id: u32,
) -> Result<Vec<ModelResponseRecord>, String> {
    use self::model_responses::dsl::*;

    let instance_id = conversions::u32_to_i32(instance_id)?;
    model_responses
        .filter(task_instance_id.eq(instance_id))
        .order(model_number.asc())
        .load::<ModelResponsePrivate>(conn)
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(private_to_public)
        .collect()
}
