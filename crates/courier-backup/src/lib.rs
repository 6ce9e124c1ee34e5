pub mod cancel;
pub mod cipher;
pub mod error;
pub mod export;
pub mod frame;
pub mod import;
pub mod source;

pub use cancel::CancellationSignal;
pub use error::BackupError;
pub use export::{export, export_filtered, BackupFilter};
pub use frame::{BackupFrame, KeyValueContent, SqlParameter, SqlStatement};
pub use import::{read_all, BackupContents, BackupReader};
pub use source::{
    BackupDataSource, BlobHandle, BlobKind, InMemoryDataSource, SchemaEntry, TableRow,
};

#[cfg(test)]
mod tests;
