use crate::error::BackupError;
use crate::frame::{KeyValueContent, SqlStatement};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

/// A table row ready for export. `expired` marks disappearing or view-once
/// content that has already lapsed and must not be carried into a backup.
#[derive(Clone, Debug)]
pub struct TableRow {
    pub statement: SqlStatement,
    pub expired: bool,
}

impl TableRow {
    pub fn live(statement: SqlStatement) -> Self {
        Self {
            statement,
            expired: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchemaEntry {
    pub statement: String,
    /// Set when the statement creates a table, so the exporter knows to walk
    /// its rows afterwards.
    pub table: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Attachment { row_id: u64 },
    Sticker { row_id: u64 },
    Avatar { recipient_id: String },
}

#[derive(Clone, Debug)]
pub struct BlobHandle {
    pub kind: BlobKind,
    pub length: u64,
}

/// Read-side collaborator for the export engine: the local data store,
/// abstracted so the engine never touches storage directly.
pub trait BackupDataSource: Send + Sync {
    fn database_version(&self) -> u32;
    fn schema(&self) -> Vec<SchemaEntry>;
    fn table_rows(&self, table: &str) -> Result<Vec<TableRow>, BackupError>;
    fn preferences(&self) -> Vec<(String, String, String)>;
    fn key_values(&self) -> Vec<(String, KeyValueContent)>;
    fn blobs(&self) -> Vec<BlobHandle>;
    fn open_blob(&self, handle: &BlobHandle) -> Result<Box<dyn Read + Send>, BackupError>;
}

/// In-memory data source used by tests and as a reference implementation.
#[derive(Default)]
pub struct InMemoryDataSource {
    pub database_version: u32,
    pub schema: Vec<SchemaEntry>,
    pub rows: HashMap<String, Vec<TableRow>>,
    pub preferences: Vec<(String, String, String)>,
    pub key_values: Vec<(String, KeyValueContent)>,
    blobs: Mutex<Vec<(BlobHandle, Vec<u8>)>>,
}

impl InMemoryDataSource {
    pub fn new(database_version: u32) -> Self {
        Self {
            database_version,
            ..Self::default()
        }
    }

    pub fn add_table(&mut self, name: &str, rows: Vec<TableRow>) {
        self.schema.push(SchemaEntry {
            statement: format!("CREATE TABLE {} (data)", name),
            table: Some(name.to_string()),
        });
        self.rows.insert(name.to_string(), rows);
    }

    pub fn add_index(&mut self, statement: &str) {
        self.schema.push(SchemaEntry {
            statement: statement.to_string(),
            table: None,
        });
    }

    pub fn add_blob(&mut self, kind: BlobKind, data: Vec<u8>) {
        let handle = BlobHandle {
            kind,
            length: data.len() as u64,
        };
        self.blobs.lock().expect("blobs").push((handle, data));
    }
}

impl BackupDataSource for InMemoryDataSource {
    fn database_version(&self) -> u32 {
        self.database_version
    }

    fn schema(&self) -> Vec<SchemaEntry> {
        self.schema.clone()
    }

    fn table_rows(&self, table: &str) -> Result<Vec<TableRow>, BackupError> {
        Ok(self.rows.get(table).cloned().unwrap_or_default())
    }

    fn preferences(&self) -> Vec<(String, String, String)> {
        self.preferences.clone()
    }

    fn key_values(&self) -> Vec<(String, KeyValueContent)> {
        self.key_values.clone()
    }

    fn blobs(&self) -> Vec<BlobHandle> {
        self.blobs
            .lock()
            .expect("blobs")
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    fn open_blob(&self, handle: &BlobHandle) -> Result<Box<dyn Read + Send>, BackupError> {
        let guard = self.blobs.lock().expect("blobs");
        let found = guard
            .iter()
            .find(|(h, _)| h.kind == handle.kind)
            .map(|(_, data)| data.clone())
            .ok_or(BackupError::Truncated)?;
        Ok(Box::new(Cursor::new(found)))
    }
}
