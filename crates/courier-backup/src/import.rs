use crate::cipher::{derive_frame_keys, FrameCipher, TAG_LEN};
use crate::error::BackupError;
use crate::frame::{BackupFrame, KeyValueContent, SqlStatement, FORMAT_VERSION};
use crate::source::BlobKind;
use std::io::Read;

/// Decoder for the backup container. Frames are pulled one at a time;
/// reaching EOF before the terminal `End` frame is reported as truncation.
pub struct BackupReader<R: Read> {
    input: R,
    cipher: FrameCipher,
    finished: bool,
}

impl<R: Read> BackupReader<R> {
    /// Reads the cleartext header and derives the frame keys. A wrong
    /// passphrase is not detected here; it surfaces as a MAC mismatch on the
    /// first encrypted frame.
    pub fn open(mut input: R, passphrase: &str) -> Result<Self, BackupError> {
        let header_bytes = read_prefixed(&mut input)?.ok_or(BackupError::Truncated)?;
        let header: BackupFrame =
            serde_json::from_slice(&header_bytes).map_err(|_| BackupError::Codec)?;
        let BackupFrame::Header { version, salt, iv } = header else {
            return Err(BackupError::Codec);
        };
        if version != FORMAT_VERSION {
            return Err(BackupError::UnsupportedVersion(version));
        }
        let iv: [u8; crate::cipher::IV_LEN] = iv.try_into().map_err(|_| BackupError::Codec)?;
        let keys = derive_frame_keys(passphrase, &salt)?;
        Ok(Self {
            input,
            cipher: FrameCipher::new(keys, iv),
            finished: false,
        })
    }

    /// Returns the next frame, or `None` once the `End` frame was consumed.
    pub fn next_frame(&mut self) -> Result<Option<BackupFrame>, BackupError> {
        if self.finished {
            return Ok(None);
        }
        let sealed = read_prefixed(&mut self.input)?.ok_or(BackupError::Truncated)?;
        let plaintext = self.cipher.open(&sealed)?;
        let frame: BackupFrame =
            serde_json::from_slice(&plaintext).map_err(|_| BackupError::Codec)?;
        if matches!(frame, BackupFrame::End) {
            self.finished = true;
        }
        Ok(Some(frame))
    }

    /// Reads, authenticates and decrypts a streamed blob body declared by
    /// the preceding frame.
    pub fn read_blob(&mut self, length: u64) -> Result<Vec<u8>, BackupError> {
        let mut body = read_limited(&mut self.input, length)?;
        let mut tag = [0u8; TAG_LEN];
        self.input
            .read_exact(&mut tag)
            .map_err(|_| BackupError::Truncated)?;
        let mut opener = self.cipher.begin_stream()?;
        opener.open_chunk(&mut body);
        opener.verify(&tag)?;
        Ok(body)
    }
}

fn read_prefixed(input: &mut impl Read) -> Result<Option<Vec<u8>>, BackupError> {
    let mut len = [0u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BackupError::Io(e)),
    }
    let len = u32::from_be_bytes(len);
    Ok(Some(read_limited(input, u64::from(len))?))
}

/// Reads exactly `length` bytes without trusting `length` for allocation.
/// The declared size is attacker-controlled; the buffer grows only as far as
/// the input actually delivers, so a corrupt prefix cannot force a huge
/// allocation up front.
fn read_limited(input: &mut impl Read, length: u64) -> Result<Vec<u8>, BackupError> {
    let mut bytes = Vec::new();
    input
        .take(length)
        .read_to_end(&mut bytes)
        .map_err(|_| BackupError::Truncated)?;
    if bytes.len() as u64 != length {
        return Err(BackupError::Truncated);
    }
    Ok(bytes)
}

/// Fully-decoded backup contents, used to verify round trips.
#[derive(Debug, Default, PartialEq)]
pub struct BackupContents {
    pub database_version: u32,
    pub statements: Vec<SqlStatement>,
    pub preferences: Vec<(String, String, String)>,
    pub key_values: Vec<(String, KeyValueContent)>,
    pub blobs: Vec<(BlobKind, Vec<u8>)>,
}

/// Decodes an entire stream, enforcing the terminal frame requirement.
pub fn read_all<R: Read>(input: R, passphrase: &str) -> Result<BackupContents, BackupError> {
    let mut reader = BackupReader::open(input, passphrase)?;
    let mut contents = BackupContents::default();
    let mut saw_end = false;
    while let Some(frame) = reader.next_frame()? {
        match frame {
            BackupFrame::Header { .. } => return Err(BackupError::Codec),
            BackupFrame::DatabaseVersion { version } => contents.database_version = version,
            BackupFrame::Statement { statement } => contents.statements.push(statement),
            BackupFrame::Preference { file, key, value } => {
                contents.preferences.push((file, key, value))
            }
            BackupFrame::KeyValue { key, value } => contents.key_values.push((key, value)),
            BackupFrame::Attachment { row_id, length } => {
                let body = reader.read_blob(length)?;
                contents.blobs.push((BlobKind::Attachment { row_id }, body));
            }
            BackupFrame::Sticker { row_id, length } => {
                let body = reader.read_blob(length)?;
                contents.blobs.push((BlobKind::Sticker { row_id }, body));
            }
            BackupFrame::Avatar {
                recipient_id,
                length,
            } => {
                let body = reader.read_blob(length)?;
                contents.blobs.push((BlobKind::Avatar { recipient_id }, body));
            }
            BackupFrame::End => saw_end = true,
        }
    }
    if !saw_end {
        return Err(BackupError::Truncated);
    }
    Ok(contents)
}
