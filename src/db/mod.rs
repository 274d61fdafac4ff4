use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;

use crate::models::{InvoiceRecord, OutcomeStatus, ProcessingLog, StoredInvoice};
use crate::utils::now_rfc3339;

const INVOICE_COLUMNS: &str = "id, filename, content_type, file_hash, status, message, invoice_number,
     date, vendor_name, total_amount, category, raw_data, created_at";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(db_path: &Path) -> SqlResult<Self> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> SqlResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = [
            (
                "001_create_invoices.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_invoices.sql"
                )),
            ),
            (
                "002_create_settings_and_processing_logs.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_settings_and_processing_logs.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                    params![name, now_rfc3339()],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    /// Inserts a new row. Stored invoices are never updated, so an id clash
    /// is an error rather than a replace.
    pub fn save_invoice(&self, invoice: &StoredInvoice) -> SqlResult<()> {
        let raw_data = serde_json::to_string(&invoice.extracted_data)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT INTO invoices (
                id, filename, content_type, file_hash, status, message, invoice_number,
                date, vendor_name, total_amount, category, raw_data, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                invoice.id,
                invoice.filename,
                invoice.content_type,
                invoice.file_hash,
                invoice.status.as_str(),
                invoice.message,
                invoice.invoice_number,
                invoice.date,
                invoice.vendor_name,
                invoice.total_amount,
                invoice.category,
                raw_data,
                invoice.created_at
            ],
        )?;
        Ok(())
    }

    /// Newest first; insertion order breaks timestamp ties.
    pub fn get_all_invoices(&self) -> SqlResult<Vec<StoredInvoice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM invoices ORDER BY created_at DESC, rowid DESC",
            INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map([], invoice_from_row)?;
        rows.collect()
    }

    pub fn get_invoice_by_id(&self, id: &str) -> SqlResult<Option<StoredInvoice>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS))?;
        stmt.query_row(params![id], invoice_from_row).optional()
    }

    pub fn find_by_hash(&self, file_hash: &str) -> SqlResult<Option<StoredInvoice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM invoices WHERE file_hash = ?1 ORDER BY created_at DESC LIMIT 1",
            INVOICE_COLUMNS
        ))?;
        stmt.query_row(params![file_hash], invoice_from_row).optional()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> SqlResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        stmt.query_row(params![key], |row| row.get(0)).optional()
    }

    pub fn log_processing(
        &self,
        invoice_id: Option<&str>,
        stage: &str,
        status: &str,
        message: Option<&str>,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO processing_logs (id, invoice_id, stage, status, message, created_at)
             VALUES (hex(randomblob(16)), ?1, ?2, ?3, ?4, ?5)",
            params![invoice_id, stage, status, message, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_processing_logs(&self, invoice_id: &str) -> SqlResult<Vec<ProcessingLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, invoice_id, stage, status, message, created_at
             FROM processing_logs WHERE invoice_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![invoice_id], |row| {
            Ok(ProcessingLog {
                id: row.get(0)?,
                invoice_id: row.get(1)?,
                stage: row.get(2)?,
                status: row.get(3)?,
                message: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        rows.collect()
    }
}

fn invoice_from_row(row: &Row<'_>) -> SqlResult<StoredInvoice> {
    let status: String = row.get(4)?;
    let status = status.parse::<OutcomeStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into())
    })?;
    let raw_data: String = row.get(11)?;
    let extracted_data: InvoiceRecord = serde_json::from_str(&raw_data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(StoredInvoice {
        id: row.get(0)?,
        filename: row.get(1)?,
        content_type: row.get(2)?,
        file_hash: row.get(3)?,
        status,
        message: row.get(5)?,
        invoice_number: row.get(6)?,
        date: row.get(7)?,
        vendor_name: row.get(8)?,
        total_amount: row.get(9)?,
        category: row.get(10)?,
        extracted_data,
        created_at: row.get(12)?,
    })
}
