//! SQL synthesis from natural-language sub-questions
//!
//! Builds a schema-grounded prompt, asks the completion model for a
//! single PostgreSQL SELECT, and strips markdown fences from the reply.
//! The model is told to answer with a fixed marker when the schema
//! cannot satisfy the question; that marker surfaces here as a model
//! error so the pipeline can record a synthesis failure.

use tandem_common::errors::{AppError, Result};
use tandem_common::llm::CompletionClient;
use tandem_common::schema::SchemaDescriptor;

/// Marker the model emits when the schema cannot answer the question.
const DECLINE_MARKER: &str = "Cannot generate SQL";

/// Ask the model for a SELECT statement answering `sub_question`.
pub async fn synthesize(
    llm: &dyn CompletionClient,
    sub_question: &str,
    schema: &SchemaDescriptor,
) -> Result<String> {
    let prompt = build_sql_prompt(sub_question, schema);
    let raw = llm.complete(&prompt).await?;
    let sql = extract_sql(&raw);
    if sql.is_empty() || sql.contains(DECLINE_MARKER) {
        return Err(AppError::ModelError {
            message: format!("no SQL produced for sub-question: {sub_question}"),
        });
    }
    Ok(sql)
}

/// Strip markdown code fences from a model reply.
fn extract_sql(raw: &str) -> String {
    let mut content = raw.trim();
    if let Some(stripped) = content.strip_prefix("```sql") {
        content = stripped;
    } else if let Some(stripped) = content.strip_prefix("```") {
        content = stripped;
    }
    if let Some(stripped) = content.strip_suffix("```") {
        content = stripped;
    }
    content.trim().to_string()
}

fn build_sql_prompt(sub_question: &str, schema: &SchemaDescriptor) -> String {
    format!(
        "You are an expert SQL generator. Based on the database schema below, \
        write one valid PostgreSQL SELECT query answering the user question.\n\n\
        Schema:\n{schema_block}\n\
        Column name rules:\n\
        - Write column names in lowercase WITHOUT double quotes (year, round, winner). \
        Casing is repaired afterwards against the real schema.\n\
        - ALWAYS wrap table names in double quotes.\n\n\
        Query rules:\n\
        - Use only tables and columns from the schema above.\n\
        - SELECT statements only; never INSERT, UPDATE, or DELETE.\n\
        - Use COUNT, SUM, AVG, and joins where the question calls for them.\n\
        - For percentage questions, compute ROUND((count * 100.0 / total), 2) \
        and give the result column a descriptive name.\n\
        - Do not combine STRING_AGG(DISTINCT ...) with ORDER BY; PostgreSQL \
        rejects DISTINCT with ORDER BY on a different expression.\n\
        - If the schema cannot answer the question, reply exactly: \
        Cannot generate SQL for this query.\n\
        - Reply with the bare SQL only, no explanations and no markdown.\n\n\
        Examples:\n\n\
        Question: What percentage of matches were draws?\n\
        SELECT ROUND((COUNT(CASE WHEN winner = 'Draw' THEN 1 END) * 100.0 / COUNT(*)), 2) \
        AS percentage_of_draws FROM \"{table}\"\n\n\
        Question: Who won the 1950 Final?\n\
        SELECT winner FROM \"{table}\" WHERE year = 1950 AND round = 'Final'\n\n\
        Question: {sub_question}\n",
        schema_block = schema.prompt_block(),
        table = schema
            .primary_table()
            .map(|t| t.table_name.as_str())
            .unwrap_or("table"),
    )
}
