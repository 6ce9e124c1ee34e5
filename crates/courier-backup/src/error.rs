use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("canceled")]
    Canceled,
    #[error("crypto")]
    Crypto,
    #[error("mac mismatch")]
    MacMismatch,
    #[error("codec")]
    Codec,
    #[error("truncated stream")]
    Truncated,
    #[error("size mismatch: declared {declared}, wrote {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
}
