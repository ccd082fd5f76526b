//! SQL command handlers

use anyhow::{Context, Result};

use sqlport_core::{params_from_json, Store, Value};

use crate::output::{Output, OutputFormat};

/// Parse `--param` arguments as JSON values
///
/// Anything that is not valid JSON binds as text, so `--param alice`
/// works without quoting.
pub fn parse_params(raw: &[String]) -> Result<Option<Vec<Value>>> {
    if raw.is_empty() {
        return Ok(None);
    }

    let json = raw
        .iter()
        .map(|p| serde_json::from_str(p).unwrap_or_else(|_| serde_json::Value::String(p.clone())))
        .collect();
    let params = params_from_json(json).context("Invalid parameter")?;
    Ok(Some(params))
}

/// Run statements against the primary database
pub async fn exec(store: &Store, sql: &str, params: &[String], output: &Output) -> Result<()> {
    let db = store.primary()?;
    let params = parse_params(params)?;

    store
        .execute(db, sql, params)
        .await
        .context("Statement failed")?;

    output.success("Executed");
    Ok(())
}

/// Run a query and print rows as they are produced
pub async fn query(store: &Store, sql: &str, params: &[String], output: &Output) -> Result<()> {
    let db = store.primary()?;
    let params = parse_params(params)?;

    let mut rows = store
        .query(db, sql, params)
        .await
        .context("Query failed")?;

    let mut count = 0;
    let mut json_rows = Vec::new();
    while let Some(row) = rows.next().await.context("Query failed")? {
        if count == 0 {
            output.print_header(&row);
        }
        count += 1;

        if output.format == OutputFormat::Json {
            json_rows.push(row.to_json());
        } else {
            output.print_row(&row);
        }
    }

    if output.is_json() {
        output.print_rows_json(&json_rows);
    } else {
        output.print_row_count(count);
    }
    Ok(())
}
