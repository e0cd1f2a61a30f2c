//! Live-schema introspection and dynamic statement execution.
//!
//! The rest of the crate treats the database purely as a read source: the
//! pipeline builds its catalog from [`get_schema`], and the agent's
//! observation step runs candidate statements through [`execute`].

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::models::{DatabaseSchema, ForeignKey, TableInfo};

/// A dynamically decoded result row.
pub type ResultRow = BTreeMap<String, serde_json::Value>;

/// Quote an identifier for embedding in a PRAGMA statement.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fetch the full schema mapping: every table and view (excluding SQLite
/// internals), its columns in declared order, declared column types, and,
/// for tables, foreign keys grouped per constraint.
pub async fn get_schema(pool: &SqlitePool) -> Result<DatabaseSchema> {
    let relations = sqlx::query(
        "SELECT name, type FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tables and views")?;

    let mut schema = DatabaseSchema::new();

    for relation in &relations {
        let name: String = relation.get("name");
        let kind: String = relation.get("type");
        let is_view = kind == "view";

        let column_rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&name)))
            .fetch_all(pool)
            .await
            .with_context(|| format!("Failed to read columns for {name}"))?;

        let mut columns = Vec::with_capacity(column_rows.len());
        let mut types = BTreeMap::new();
        for row in &column_rows {
            let column: String = row.get("name");
            let data_type: String = row.get("type");
            columns.push(column.clone());
            types.insert(column, data_type);
        }

        let foreign_keys = if is_view {
            None
        } else {
            let fks = get_foreign_keys(pool, &name).await?;
            (!fks.is_empty()).then_some(fks)
        };

        schema.insert(
            name,
            TableInfo {
                columns,
                types,
                is_view,
                foreign_keys,
            },
        );
    }

    Ok(schema)
}

/// Read `PRAGMA foreign_key_list` and group rows by constraint id so
/// composite keys come back as one [`ForeignKey`].
async fn get_foreign_keys(pool: &SqlitePool, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = sqlx::query(&format!(
        "PRAGMA foreign_key_list({})",
        quote_ident(table)
    ))
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to read foreign keys for {table}"))?;

    // Rows arrive ordered by (id, seq); fold consecutive rows of the same
    // constraint together.
    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for row in &rows {
        let id: i64 = row.get("id");
        let from: String = row.get("from");
        let referred_table: String = row.get("table");
        let to: Option<String> = row.get("to");
        let to = to.unwrap_or_default();

        match keys.last_mut() {
            Some((last_id, fk)) if *last_id == id => {
                fk.constrained_columns.push(from);
                fk.referred_columns.push(to);
            }
            _ => keys.push((
                id,
                ForeignKey {
                    constrained_columns: vec![from],
                    referred_table,
                    referred_columns: vec![to],
                },
            )),
        }
    }

    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

/// Execute a statement and decode every row dynamically.
///
/// SQLite values map to JSON as NULL → null, INTEGER → number, REAL →
/// number, TEXT → string, BLOB → hex string.
pub async fn execute(pool: &SqlitePool, sql: &str) -> Result<Vec<ResultRow>> {
    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .context("Statement execution failed")?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut out = ResultRow::new();
        for (i, column) in row.columns().iter().enumerate() {
            out.insert(column.name().to_string(), decode_value(row, i)?);
        }
        decoded.push(out);
    }

    Ok(decoded)
}

fn decode_value(row: &sqlx::sqlite::SqliteRow, i: usize) -> Result<serde_json::Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(serde_json::Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "INTEGER" => serde_json::Value::from(row.try_get::<i64, _>(i)?),
        "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        "BLOB" => serde_json::Value::from(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
        _ => serde_json::Value::from(row.try_get::<String, _>(i)?),
    };
    Ok(value)
}
