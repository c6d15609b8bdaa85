//! Idempotent DDL primitives.
//!
//! MySQL has no `ADD COLUMN IF NOT EXISTS` or `CREATE INDEX IF NOT EXISTS`,
//! so these helpers probe `INFORMATION_SCHEMA` into a session variable,
//! build the DDL conditionally as a string, and run it through
//! `PREPARE`/`EXECUTE`. Re-running any of them against an up-to-date table
//! is a no-op rather than an error, which is what makes additive schema
//! upgrades safe to race between processes.

use courier_core::TransportError;

use crate::connection::DbConnection;
use crate::table_name::TableName;

/// Add `column` with `definition` unless the table already has it.
pub async fn create_column_if_not_exists(
    conn: &mut DbConnection,
    table: &TableName,
    column: &str,
    definition: &str,
) -> Result<(), TransportError> {
    let statements = conditional_ddl(
        &format!(
            "SELECT COUNT(*) = 0 INTO @courier_apply FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND COLUMN_NAME = {}",
            schema_expr(table),
            quote_str(table.name()),
            quote_str(column)
        ),
        &format!(
            "ALTER TABLE {} ADD COLUMN `{column}` {definition}",
            table.qualified()
        ),
    );
    run_all(conn, &statements).await
}

/// Drop `column` if the table has it.
pub async fn drop_column_if_exists(
    conn: &mut DbConnection,
    table: &TableName,
    column: &str,
) -> Result<(), TransportError> {
    let statements = conditional_ddl(
        &format!(
            "SELECT COUNT(*) > 0 INTO @courier_apply FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND COLUMN_NAME = {}",
            schema_expr(table),
            quote_str(table.name()),
            quote_str(column)
        ),
        &format!("ALTER TABLE {} DROP COLUMN `{column}`", table.qualified()),
    );
    run_all(conn, &statements).await
}

/// Create index `index_name` over `columns` (a ready-to-splice column list,
/// e.g. `` "`priority` DESC, `visible`" ``) unless it already exists.
pub async fn create_index_if_not_exists(
    conn: &mut DbConnection,
    table: &TableName,
    index_name: &str,
    columns: &str,
) -> Result<(), TransportError> {
    let statements = conditional_ddl(
        &format!(
            "SELECT COUNT(*) = 0 INTO @courier_apply FROM INFORMATION_SCHEMA.STATISTICS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND INDEX_NAME = {}",
            schema_expr(table),
            quote_str(table.name()),
            quote_str(index_name)
        ),
        &format!(
            "CREATE INDEX `{index_name}` ON {} ({columns})",
            table.qualified()
        ),
    );
    run_all(conn, &statements).await
}

/// Drop index `index_name` if it exists.
pub async fn drop_index_if_exists(
    conn: &mut DbConnection,
    table: &TableName,
    index_name: &str,
) -> Result<(), TransportError> {
    let statements = conditional_ddl(
        &format!(
            "SELECT COUNT(*) > 0 INTO @courier_apply FROM INFORMATION_SCHEMA.STATISTICS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND INDEX_NAME = {}",
            schema_expr(table),
            quote_str(table.name()),
            quote_str(index_name)
        ),
        &format!("DROP INDEX `{index_name}` ON {}", table.qualified()),
    );
    run_all(conn, &statements).await
}

/// The five-statement conditional-DDL sequence: probe into
/// `@courier_apply`, pick the DDL or a no-op, then prepare and execute it.
fn conditional_ddl(probe: &str, ddl: &str) -> Vec<String> {
    vec![
        probe.to_string(),
        format!(
            "SET @courier_ddl = IF(@courier_apply, {}, 'SELECT 1')",
            quote_str(ddl)
        ),
        "PREPARE courier_schema_stmt FROM @courier_ddl".to_string(),
        "EXECUTE courier_schema_stmt".to_string(),
        "DEALLOCATE PREPARE courier_schema_stmt".to_string(),
    ]
}

async fn run_all(conn: &mut DbConnection, statements: &[String]) -> Result<(), TransportError> {
    for statement in statements {
        sqlx::query(statement)
            .execute(conn.conn())
            .await
            .map_err(TransportError::db)?;
    }
    Ok(())
}

/// SQL expression for the schema the table lives in.
fn schema_expr(table: &TableName) -> String {
    match table.schema() {
        Some(schema) => quote_str(schema),
        None => "DATABASE()".to_string(),
    }
}

/// Single-quote a string literal, doubling embedded quotes.
fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_ddl_prepares_the_guarded_statement() {
        let statements = conditional_ddl(
            "SELECT COUNT(*) = 0 INTO @courier_apply FROM x",
            "ALTER TABLE `q` ADD COLUMN `ordering_key` VARCHAR(200) NULL",
        );
        assert_eq!(statements.len(), 5);
        assert!(statements[1].contains("IF(@courier_apply"));
        assert!(statements[1].contains("'ALTER TABLE `q` ADD COLUMN `ordering_key` VARCHAR(200) NULL'"));
        assert!(statements[2].starts_with("PREPARE"));
        assert!(statements[4].starts_with("DEALLOCATE"));
    }

    #[test]
    fn string_literals_are_escaped() {
        assert_eq!(quote_str("it's"), "'it''s'");
    }

    #[test]
    fn schema_defaults_to_current_database() {
        assert_eq!(schema_expr(&TableName::new("q")), "DATABASE()");
        assert_eq!(
            schema_expr(&TableName::with_schema("bus", "q")),
            "'bus'"
        );
    }
}
