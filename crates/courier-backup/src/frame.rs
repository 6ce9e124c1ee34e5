use serde::{Deserialize, Serialize};

pub const FORMAT_VERSION: u32 = 1;

/// One record in the backup stream. Every frame except the header is
/// individually encrypted and authenticated; the header is the only
/// cleartext content and carries the salt and initial IV needed to derive
/// the frame keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub enum BackupFrame {
    Header {
        version: u32,
        salt: Vec<u8>,
        iv: Vec<u8>,
    },
    DatabaseVersion {
        version: u32,
    },
    Statement {
        statement: SqlStatement,
    },
    Preference {
        file: String,
        key: String,
        value: String,
    },
    KeyValue {
        key: String,
        value: KeyValueContent,
    },
    /// Declares a streamed attachment body of `length` ciphertext bytes
    /// (plus its own tag) immediately following this frame.
    Attachment {
        row_id: u64,
        length: u64,
    },
    Sticker {
        row_id: u64,
        length: u64,
    },
    Avatar {
        recipient_id: String,
        length: u64,
    },
    End,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SqlStatement {
    pub statement: String,
    pub parameters: Vec<SqlParameter>,
}

impl SqlStatement {
    pub fn schema(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            parameters: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SqlParameter {
    Text(String),
    Integer(i64),
    Real(f64),
    Blob(Vec<u8>),
    Null,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum KeyValueContent {
    Blob(Vec<u8>),
    Boolean(bool),
    Float(f64),
    Integer(i64),
    Text(String),
}
