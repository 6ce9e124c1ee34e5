use crate::cancel::CancellationSignal;
use crate::cipher::{derive_frame_keys, FrameCipher, IV_LEN, SALT_LEN};
use crate::error::BackupError;
use crate::frame::{BackupFrame, FORMAT_VERSION};
use crate::source::{BackupDataSource, BlobHandle, BlobKind};
use rand::RngCore;
use std::collections::HashSet;
use std::io::Write;
use tracing::info;

const STREAM_CHUNK: usize = 8 * 1024;

/// Tables that must never leave the device, plus shadow-table prefixes that
/// are regenerable and excluded wholesale.
#[derive(Clone, Debug)]
pub struct BackupFilter {
    pub blacklisted_tables: HashSet<String>,
    pub shadow_prefixes: Vec<String>,
}

impl Default for BackupFilter {
    fn default() -> Self {
        let blacklisted_tables = ["sessions", "one_time_prekeys", "signed_prekeys"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            blacklisted_tables,
            shadow_prefixes: vec!["message_fts".to_string()],
        }
    }
}

impl BackupFilter {
    fn excludes_table(&self, name: &str) -> bool {
        if self.blacklisted_tables.contains(name) || name.starts_with("sqlite_") {
            return true;
        }
        self.shadow_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// Serializes the entire data source into an authenticated, encrypted,
/// streaming container. Cancellation is polled at every frame boundary; on
/// cancellation the sink is abandoned mid-stream (no terminal frame), which
/// a conformant reader reports as truncated.
pub fn export(
    source: &dyn BackupDataSource,
    sink: &mut dyn Write,
    passphrase: &str,
    cancel: &CancellationSignal,
    on_progress: &mut dyn FnMut(usize),
) -> Result<(), BackupError> {
    export_filtered(
        source,
        sink,
        passphrase,
        &BackupFilter::default(),
        cancel,
        on_progress,
    )
}

pub fn export_filtered(
    source: &dyn BackupDataSource,
    sink: &mut dyn Write,
    passphrase: &str,
    filter: &BackupFilter,
    cancel: &CancellationSignal,
    on_progress: &mut dyn FnMut(usize),
) -> Result<(), BackupError> {
    let mut writer = FrameWriter::open(sink, passphrase)?;
    let mut count = 0usize;

    writer.write_frame(&BackupFrame::DatabaseVersion {
        version: source.database_version(),
    })?;
    count += 1;
    on_progress(count);

    let mut tables = Vec::new();
    for entry in source.schema() {
        throw_if_canceled(cancel)?;
        if let Some(table) = entry.table.as_ref() {
            if filter.excludes_table(table) {
                continue;
            }
            tables.push(table.clone());
        } else if let Some(referenced) = referenced_table(&entry.statement) {
            // Indexes and triggers name their table after ON; skip them when
            // that table is excluded.
            if filter.excludes_table(&referenced) {
                continue;
            }
        }
        writer.write_frame(&BackupFrame::Statement {
            statement: crate::frame::SqlStatement::schema(entry.statement),
        })?;
        count += 1;
        on_progress(count);
    }

    for table in tables {
        for row in source.table_rows(&table)? {
            throw_if_canceled(cancel)?;
            if row.expired {
                continue;
            }
            writer.write_frame(&BackupFrame::Statement {
                statement: row.statement,
            })?;
            count += 1;
            on_progress(count);
        }
        info!(table = %table, "exported table");
    }

    for (file, key, value) in source.preferences() {
        throw_if_canceled(cancel)?;
        writer.write_frame(&BackupFrame::Preference { file, key, value })?;
        count += 1;
        on_progress(count);
    }

    for (key, value) in source.key_values() {
        throw_if_canceled(cancel)?;
        writer.write_frame(&BackupFrame::KeyValue { key, value })?;
        count += 1;
        on_progress(count);
    }

    for handle in source.blobs() {
        throw_if_canceled(cancel)?;
        let mut reader = source.open_blob(&handle)?;
        writer.write_blob(&handle, reader.as_mut())?;
        count += 1;
        on_progress(count);
    }

    writer.write_frame(&BackupFrame::End)?;
    count += 1;
    on_progress(count);
    info!(frames = count, "backup export complete");
    Ok(())
}

fn referenced_table(statement: &str) -> Option<String> {
    let mut words = statement.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("on") {
            let name: String = words
                .next()?
                .trim_start_matches(['"', '`', '['])
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            return (!name.is_empty()).then_some(name);
        }
    }
    None
}

fn throw_if_canceled(cancel: &CancellationSignal) -> Result<(), BackupError> {
    if cancel.is_canceled() {
        return Err(BackupError::Canceled);
    }
    Ok(())
}

struct FrameWriter<'a> {
    sink: &'a mut dyn Write,
    cipher: FrameCipher,
}

impl<'a> FrameWriter<'a> {
    /// Writes the cleartext header frame and sets up the frame cipher. The
    /// header is the only unencrypted content in the stream.
    fn open(sink: &'a mut dyn Write, passphrase: &str) -> Result<Self, BackupError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);
        let keys = derive_frame_keys(passphrase, &salt)?;

        let header = BackupFrame::Header {
            version: FORMAT_VERSION,
            salt: salt.to_vec(),
            iv: iv.to_vec(),
        };
        let bytes = serde_json::to_vec(&header).map_err(|_| BackupError::Codec)?;
        sink.write_all(&(bytes.len() as u32).to_be_bytes())?;
        sink.write_all(&bytes)?;

        Ok(Self {
            sink,
            cipher: FrameCipher::new(keys, iv),
        })
    }

    fn write_frame(&mut self, frame: &BackupFrame) -> Result<(), BackupError> {
        let plaintext = serde_json::to_vec(frame).map_err(|_| BackupError::Codec)?;
        let sealed = self.cipher.seal(&plaintext)?;
        self.sink.write_all(&(sealed.len() as u32).to_be_bytes())?;
        self.sink.write_all(&sealed)?;
        Ok(())
    }

    /// Writes the blob's declaring frame, then streams the body through its
    /// own cipher and tag so arbitrarily large payloads never get buffered
    /// into a single frame.
    fn write_blob(
        &mut self,
        handle: &BlobHandle,
        reader: &mut dyn std::io::Read,
    ) -> Result<(), BackupError> {
        let frame = match &handle.kind {
            BlobKind::Attachment { row_id } => BackupFrame::Attachment {
                row_id: *row_id,
                length: handle.length,
            },
            BlobKind::Sticker { row_id } => BackupFrame::Sticker {
                row_id: *row_id,
                length: handle.length,
            },
            BlobKind::Avatar { recipient_id } => BackupFrame::Avatar {
                recipient_id: recipient_id.clone(),
                length: handle.length,
            },
        };
        self.write_frame(&frame)?;

        let mut sealer = self.cipher.begin_stream()?;
        let mut buffer = [0u8; STREAM_CHUNK];
        let mut total = 0u64;
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            sealer.seal_chunk(&mut buffer[..read]);
            self.sink.write_all(&buffer[..read])?;
            total += read as u64;
        }
        if total != handle.length {
            return Err(BackupError::SizeMismatch {
                declared: handle.length,
                actual: total,
            });
        }
        self.sink.write_all(&sealer.finish())?;
        Ok(())
    }
}
