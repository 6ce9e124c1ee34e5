use crate::error::BackupError;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 10;
const STRETCH_ROUNDS: usize = 250_000;
const HKDF_INFO: &[u8] = b"courier:backup:v1";

#[derive(Clone)]
pub struct FrameKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
}

/// Stretches the passphrase with an iterated salted hash, then expands the
/// result into independent cipher and MAC keys.
pub fn derive_frame_keys(passphrase: &str, salt: &[u8]) -> Result<FrameKeys, BackupError> {
    let stretched = stretch_passphrase(passphrase, salt);
    let hkdf = Hkdf::<Sha256>::new(None, &stretched);
    let mut okm = [0u8; 64];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|_| BackupError::Crypto)?;
    let mut cipher_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    cipher_key.copy_from_slice(&okm[..32]);
    mac_key.copy_from_slice(&okm[32..]);
    Ok(FrameKeys {
        cipher_key,
        mac_key,
    })
}

fn stretch_passphrase(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let trimmed: String = passphrase.chars().filter(|c| !c.is_whitespace()).collect();
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(trimmed.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..STRETCH_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(trimmed.as_bytes());
        digest = hasher.finalize();
    }
    digest.into()
}

/// Per-frame authenticated encryption. The IV doubles as a monotonically
/// incrementing counter seeded from the random initial IV, so every frame in
/// the stream gets a unique nonce without storing one per frame.
pub struct FrameCipher {
    keys: FrameKeys,
    iv: [u8; IV_LEN],
    counter: u32,
}

impl FrameCipher {
    pub fn new(keys: FrameKeys, iv: [u8; IV_LEN]) -> Self {
        let counter = u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]]);
        Self { keys, iv, counter }
    }

    fn next_nonce(&mut self) -> [u8; IV_LEN] {
        self.iv[..4].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        self.iv
    }

    /// Encrypts one frame body and appends a truncated MAC tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, BackupError> {
        let nonce = self.next_nonce();
        let mut out = plaintext.to_vec();
        let mut cipher = ChaCha20::new_from_slices(&self.keys.cipher_key, &nonce)
            .map_err(|_| BackupError::Crypto)?;
        cipher.apply_keystream(&mut out);
        let mut mac = HmacSha256::new_from_slice(&self.keys.mac_key)
            .map_err(|_| BackupError::Crypto)?;
        mac.update(&out);
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..TAG_LEN]);
        Ok(out)
    }

    /// Verifies the truncated tag and decrypts one frame body.
    pub fn open(&mut self, blob: &[u8]) -> Result<Vec<u8>, BackupError> {
        if blob.len() < TAG_LEN {
            return Err(BackupError::Truncated);
        }
        let nonce = self.next_nonce();
        let (ciphertext, tag) = blob.split_at(blob.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.keys.mac_key)
            .map_err(|_| BackupError::Crypto)?;
        mac.update(ciphertext);
        mac.verify_truncated_left(tag)
            .map_err(|_| BackupError::MacMismatch)?;
        let mut out = ciphertext.to_vec();
        let mut cipher = ChaCha20::new_from_slices(&self.keys.cipher_key, &nonce)
            .map_err(|_| BackupError::Crypto)?;
        cipher.apply_keystream(&mut out);
        Ok(out)
    }

    /// Begins a separately-authenticated stream body. The MAC covers the
    /// nonce followed by the ciphertext.
    pub fn begin_stream(&mut self) -> Result<StreamSealer, BackupError> {
        let nonce = self.next_nonce();
        let cipher = ChaCha20::new_from_slices(&self.keys.cipher_key, &nonce)
            .map_err(|_| BackupError::Crypto)?;
        let mut mac = HmacSha256::new_from_slice(&self.keys.mac_key)
            .map_err(|_| BackupError::Crypto)?;
        mac.update(&nonce);
        Ok(StreamSealer { cipher, mac })
    }
}

pub struct StreamSealer {
    cipher: ChaCha20,
    mac: HmacSha256,
}

impl StreamSealer {
    /// Encrypts a chunk in place and folds it into the stream MAC.
    pub fn seal_chunk(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
        self.mac.update(chunk);
    }

    /// Decrypts a chunk in place; the ciphertext is MACed before decryption.
    pub fn open_chunk(&mut self, chunk: &mut [u8]) {
        self.mac.update(chunk);
        self.cipher.apply_keystream(chunk);
    }

    pub fn finish(self) -> [u8; TAG_LEN] {
        let tag = self.mac.finalize().into_bytes();
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag[..TAG_LEN]);
        out
    }

    pub fn verify(self, tag: &[u8]) -> Result<(), BackupError> {
        self.mac
            .verify_truncated_left(tag)
            .map_err(|_| BackupError::MacMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> FrameKeys {
        FrameKeys {
            cipher_key: [1u8; 32],
            mac_key: [2u8; 32],
        }
    }

    #[test]
    fn frame_roundtrip() {
        let mut sealer = FrameCipher::new(keys(), [7u8; IV_LEN]);
        let mut opener = FrameCipher::new(keys(), [7u8; IV_LEN]);
        let sealed = sealer.seal(b"frame-one").expect("seal");
        let opened = opener.open(&sealed).expect("open");
        assert_eq!(opened, b"frame-one");
        let sealed = sealer.seal(b"frame-two").expect("seal");
        let opened = opener.open(&sealed).expect("open");
        assert_eq!(opened, b"frame-two");
    }

    #[test]
    fn detects_tampering() {
        let mut sealer = FrameCipher::new(keys(), [3u8; IV_LEN]);
        let mut opener = FrameCipher::new(keys(), [3u8; IV_LEN]);
        let mut sealed = sealer.seal(b"payload").expect("seal");
        sealed[0] ^= 0xFF;
        let err = opener.open(&sealed).unwrap_err();
        assert!(matches!(err, BackupError::MacMismatch));
    }

    #[test]
    fn rejects_wrong_mac_key() {
        let mut sealer = FrameCipher::new(keys(), [4u8; IV_LEN]);
        let sealed = sealer.seal(b"payload").expect("seal");
        let other = FrameKeys {
            cipher_key: [1u8; 32],
            mac_key: [9u8; 32],
        };
        let mut opener = FrameCipher::new(other, [4u8; IV_LEN]);
        let err = opener.open(&sealed).unwrap_err();
        assert!(matches!(err, BackupError::MacMismatch));
    }

    #[test]
    fn nonces_are_unique_per_frame() {
        let mut cipher = FrameCipher::new(keys(), [0u8; IV_LEN]);
        let a = cipher.next_nonce();
        let b = cipher.next_nonce();
        assert_ne!(a, b);
    }

    #[test]
    fn stream_roundtrip() {
        let mut sealer_side = FrameCipher::new(keys(), [5u8; IV_LEN]);
        let mut opener_side = FrameCipher::new(keys(), [5u8; IV_LEN]);
        let mut sealer = sealer_side.begin_stream().expect("stream");
        let mut body = b"large attachment body".to_vec();
        sealer.seal_chunk(&mut body);
        let tag = sealer.finish();

        let mut opener = opener_side.begin_stream().expect("stream");
        opener.open_chunk(&mut body);
        opener.verify(&tag).expect("verify");
        assert_eq!(body, b"large attachment body");
    }

    #[test]
    fn derived_keys_differ_per_salt() {
        let a = derive_frame_keys("passphrase", &[1u8; SALT_LEN]).expect("derive");
        let b = derive_frame_keys("passphrase", &[2u8; SALT_LEN]).expect("derive");
        assert_ne!(a.cipher_key, b.cipher_key);
        assert_ne!(a.mac_key, b.mac_key);
        assert_ne!(a.cipher_key, a.mac_key);
    }
}
