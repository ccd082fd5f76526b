//! Statement helpers and parameter binding
//!
//! Multi-statement text is walked with [`rusqlite::Batch`], which compiles
//! one statement at a time, so a statement may depend on objects created by
//! the ones before it.

use std::sync::Arc;

use rusqlite::{Batch, Connection, Statement};

use crate::error::{StorageError, StorageResult};
use crate::value::{Row, Value};

/// Compile the first statement and bind its parameters without running it
///
/// Text without any statement only checks that no parameters were given.
pub fn check_first(conn: &Connection, sql: &str, params: Option<Vec<Value>>) -> StorageResult<()> {
    let mut params = ParamCursor::new(params);
    match Batch::new(conn, sql).next()? {
        Some(mut stmt) => params.bind(&mut stmt),
        None => params.finish(),
    }
}

/// Whether a failing statement leaves the rows it already changed in place
///
/// Only `OR FAIL` does; every other conflict resolution undoes the whole
/// statement, and `OR ROLLBACK` undoes the transaction.
pub fn keeps_partial_changes(stmt: &Statement<'_>) -> bool {
    let Some(sql) = stmt.expanded_sql() else {
        return false;
    };
    sql.split_whitespace()
        .map(str::to_ascii_uppercase)
        .collect::<Vec<_>>()
        .windows(2)
        .any(|pair| pair[0] == "OR" && pair[1] == "FAIL")
}

/// Positional parameters consumed statement by statement
///
/// Each statement takes as many values as it has placeholders. Values left
/// over once every statement is bound are an error.
pub struct ParamCursor {
    values: Vec<Value>,
    position: usize,
}

impl ParamCursor {
    pub fn new(values: Option<Vec<Value>>) -> Self {
        Self {
            values: values.unwrap_or_default(),
            position: 0,
        }
    }

    /// Bind the next values to the statement's placeholders
    pub fn bind(&mut self, stmt: &mut Statement<'_>) -> StorageResult<()> {
        let wanted = stmt.parameter_count();
        let available = self.values.len() - self.position;
        if wanted > available {
            return Err(StorageError::Engine(format!(
                "statement expects {} parameters but only {} remain",
                wanted, available
            )));
        }

        for index in 1..=wanted {
            stmt.raw_bind_parameter(index, &self.values[self.position])?;
            self.position += 1;
        }
        Ok(())
    }

    /// Fail if parameters were supplied that no statement consumed
    pub fn finish(&self) -> StorageResult<()> {
        let unused = self.values.len() - self.position;
        if unused > 0 {
            return Err(StorageError::Engine(format!(
                "{} parameters were not used by any statement",
                unused
            )));
        }
        Ok(())
    }
}

/// Column names of a prepared statement, shared by its rows
pub fn column_names(stmt: &Statement<'_>) -> Arc<[String]> {
    stmt.column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into()
}

/// Decode the current row of a cursor
pub fn decode_row(row: &rusqlite::Row<'_>, columns: &Arc<[String]>) -> StorageResult<Row> {
    let values = (0..columns.len())
        .map(|i| row.get::<_, Value>(i))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_first_reports_compile_errors() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        assert!(check_first(&conn, "SELECT 1; SELECT * FROM nowhere", None).is_ok());
        assert!(check_first(&conn, "SELECT * FROM nowhere", None).is_err());
        assert!(check_first(&conn, "SELECT ?, ?", Some(vec![Value::Integer(1)])).is_err());
        assert!(check_first(&conn, " -- nothing\n", Some(vec![Value::Integer(1)])).is_err());
    }

    #[test]
    fn test_or_fail_keeps_partial_changes() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY)").unwrap();

        let fail = conn.prepare("INSERT  or\n fail INTO t VALUES (1)").unwrap();
        assert!(keeps_partial_changes(&fail));
        let abort = conn.prepare("INSERT INTO t VALUES (1)").unwrap();
        assert!(!keeps_partial_changes(&abort));
        let replace = conn.prepare("INSERT OR REPLACE INTO t VALUES (1)").unwrap();
        assert!(!keeps_partial_changes(&replace));
    }

    #[test]
    fn test_param_cursor_spreads_values() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut cursor = ParamCursor::new(Some(vec![Value::Integer(1), Value::Integer(2)]));

        let mut first = conn.prepare("SELECT ?").unwrap();
        cursor.bind(&mut first).unwrap();
        assert!(cursor.finish().is_err());

        let mut second = conn.prepare("SELECT ?").unwrap();
        cursor.bind(&mut second).unwrap();
        assert!(cursor.finish().is_ok());

        let mut third = conn.prepare("SELECT ?").unwrap();
        assert!(cursor.bind(&mut third).is_err());
    }
}
