//! Status command handler

use anyhow::Result;

use sqlport_core::{Store, Value};

use crate::output::{Output, OutputFormat};

/// Show status information
pub async fn show(store: &Store, output: &Output) -> Result<()> {
    let config = store.config();
    let db = store.primary()?;
    let path = config.database_path();
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let version = store
        .query_all(db, "SELECT value FROM schema_info WHERE key = 'version'", None)
        .await?
        .first()
        .and_then(|row| row.get("value").and_then(Value::as_str).map(str::to_string));

    let tables: Vec<String> = store
        .query_all(
            db,
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            None,
        )
        .await?
        .iter()
        .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
        .collect();

    let mut counts = Vec::with_capacity(tables.len());
    for table in &tables {
        let sql = format!("SELECT COUNT(*) AS n FROM \"{}\"", table.replace('"', "\"\""));
        let count = store
            .query_all(db, &sql, None)
            .await?
            .first()
            .and_then(|row| row.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        counts.push((table.clone(), count));
    }

    match output.format {
        OutputFormat::Json => {
            let tables: serde_json::Map<_, _> = counts
                .iter()
                .map(|(name, count)| (name.clone(), serde_json::json!(count)))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "backend": config.backend.to_string(),
                    "data_dir": config.data_dir,
                    "database": path,
                    "size": size,
                    "schema_version": version,
                    "tables": tables
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", path.display());
        }
        OutputFormat::Human => {
            println!("SQLPort Status");
            println!("==============");
            println!();
            println!("Engine:");
            println!("  Backend: {}", config.backend);
            println!(
                "  Schema:  {}",
                version.as_deref().unwrap_or("(not applied)")
            );
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!("  Database: {}", path.display());
            println!("  Size:     {} bytes", size);
            println!();
            println!("Tables:");
            for (name, count) in &counts {
                println!("  {:<12} {}", name, count);
            }
        }
    }

    Ok(())
}
