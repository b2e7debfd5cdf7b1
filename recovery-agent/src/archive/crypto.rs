//! Passphrase encryption of archives.
//!
//! XChaCha20-Poly1305 over 1 MiB chunks. The key is derived from the
//! passphrase with HKDF-SHA256 and a random per-artifact salt. Each chunk is
//! authenticated together with its index and a final-chunk flag, so reordered,
//! dropped or truncated chunks fail to decrypt.
//!
//! Layout: `DRE1 | salt[16] | nonce[24] | { final:u8 | len:u32 LE | ciphertext }*`

use crate::utils::errors::{DrError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"DRE1";
const HKDF_INFO: &[u8] = b"recovery-agent-archive-xchacha20poly1305-v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const CHUNK_SIZE: usize = 1024 * 1024;
const TAG_LEN: usize = 16;

/// Symmetric encryption of whole artifacts.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, src: &Path, dest: &Path) -> Result<()>;
    fn decrypt(&self, src: &Path, dest: &Path) -> Result<()>;
}

/// Encryptor keyed by a configured passphrase
pub struct PassphraseEncryptor {
    passphrase: String,
}

impl std::fmt::Debug for PassphraseEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseEncryptor").finish_non_exhaustive()
    }
}

impl PassphraseEncryptor {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    fn cipher(&self, salt: &[u8]) -> Result<XChaCha20Poly1305> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), self.passphrase.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut key)
            .map_err(|e| DrError::Encryption(format!("key derivation failed: {e}")))?;
        Ok(XChaCha20Poly1305::new(&key.into()))
    }

    fn encrypt_stream<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<()> {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut salt = [0u8; SALT_LEN];
        let mut base_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut base_nonce);
        let cipher = self.cipher(&salt)?;

        output.write_all(MAGIC)?;
        output.write_all(&salt)?;
        output.write_all(&base_nonce)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut counter = 0u64;
        loop {
            let n = fill(&mut input, &mut buf)?;
            let last = n < CHUNK_SIZE;
            let ciphertext = cipher
                .encrypt(
                    &chunk_nonce(&base_nonce, counter),
                    Payload {
                        msg: &buf[..n],
                        aad: &chunk_aad(counter, last),
                    },
                )
                .map_err(|e| DrError::Encryption(format!("encryption failed: {e}")))?;

            output.write_all(&[last as u8])?;
            output.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
            output.write_all(&ciphertext)?;

            if last {
                break;
            }
            counter += 1;
        }

        output.flush()?;
        Ok(())
    }

    fn decrypt_stream<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<()> {
        let mut header = [0u8; 4 + SALT_LEN + NONCE_LEN];
        input
            .read_exact(&mut header)
            .map_err(|_| DrError::Encryption("artifact is too short to be encrypted".into()))?;
        if &header[..4] != MAGIC {
            return Err(DrError::Encryption("artifact is not an encrypted archive".into()));
        }
        let salt = &header[4..4 + SALT_LEN];
        let mut base_nonce = [0u8; NONCE_LEN];
        base_nonce.copy_from_slice(&header[4 + SALT_LEN..]);
        let cipher = self.cipher(salt)?;

        let mut counter = 0u64;
        loop {
            let mut frame = [0u8; 5];
            input
                .read_exact(&mut frame)
                .map_err(|_| DrError::Encryption("encrypted artifact is truncated".into()))?;
            let last = frame[0] == 1;
            let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
            if len > CHUNK_SIZE + TAG_LEN {
                return Err(DrError::Encryption("encrypted chunk has an invalid length".into()));
            }

            let mut ciphertext = vec![0u8; len];
            input
                .read_exact(&mut ciphertext)
                .map_err(|_| DrError::Encryption("encrypted artifact is truncated".into()))?;

            let plaintext = cipher
                .decrypt(
                    &chunk_nonce(&base_nonce, counter),
                    Payload {
                        msg: &ciphertext,
                        aad: &chunk_aad(counter, last),
                    },
                )
                .map_err(|_| {
                    DrError::Encryption(
                        "decryption failed: wrong passphrase or corrupted artifact".into(),
                    )
                })?;
            output.write_all(&plaintext)?;

            if last {
                break;
            }
            counter += 1;
        }

        let mut trailing = [0u8; 1];
        if input.read(&mut trailing)? != 0 {
            return Err(DrError::Encryption("unexpected data after final chunk".into()));
        }

        output.flush()?;
        Ok(())
    }
}

impl Encryptor for PassphraseEncryptor {
    fn encrypt(&self, src: &Path, dest: &Path) -> Result<()> {
        let result = File::open(src)
            .and_then(|input| Ok((BufReader::new(input), BufWriter::new(File::create(dest)?))))
            .map_err(|e| DrError::Encryption(format!("cannot open {}: {}", src.display(), e)))
            .and_then(|(input, output)| self.encrypt_stream(input, output))
            .map_err(|e| match e {
                DrError::Io(io) => DrError::Encryption(io.to_string()),
                other => other,
            });
        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result
    }

    fn decrypt(&self, src: &Path, dest: &Path) -> Result<()> {
        let input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(dest)?);
        let result = self.decrypt_stream(input, output);
        if result.is_err() {
            let _ = fs::remove_file(dest);
        }
        result
    }
}

fn chunk_nonce(base: &[u8; NONCE_LEN], counter: u64) -> XNonce {
    let mut nonce = *base;
    for (b, c) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *b ^= c;
    }
    XNonce::from(nonce)
}

fn chunk_aad(counter: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&counter.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Read until `buf` is full or the input is exhausted
fn fill<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roundtrip(plaintext: &[u8]) -> Vec<u8> {
        let enc = PassphraseEncryptor::new("correct horse");
        let mut sealed = Vec::new();
        enc.encrypt_stream(plaintext, &mut sealed).unwrap();
        let mut opened = Vec::new();
        enc.decrypt_stream(sealed.as_slice(), &mut opened).unwrap();
        opened
    }

    #[test]
    fn test_roundtrip_sizes() {
        assert_eq!(roundtrip(b""), b"");
        assert_eq!(roundtrip(b"archive bytes"), b"archive bytes");
        let exact = vec![0x5Au8; CHUNK_SIZE];
        assert_eq!(roundtrip(&exact), exact);
        let multi: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&multi), multi);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let mut sealed = Vec::new();
        PassphraseEncryptor::new("right")
            .encrypt_stream(&b"secret"[..], &mut sealed)
            .unwrap();

        let mut opened = Vec::new();
        let err = PassphraseEncryptor::new("wrong")
            .decrypt_stream(sealed.as_slice(), &mut opened)
            .unwrap_err();
        assert!(matches!(err, DrError::Encryption(_)));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let enc = PassphraseEncryptor::new("pw");
        let plaintext = vec![1u8; CHUNK_SIZE + 100];
        let mut sealed = Vec::new();
        enc.encrypt_stream(plaintext.as_slice(), &mut sealed).unwrap();

        // Drop the final chunk entirely
        let first_frame_end = 4 + SALT_LEN + NONCE_LEN + 5 + CHUNK_SIZE + TAG_LEN;
        let mut opened = Vec::new();
        let err = enc
            .decrypt_stream(&sealed[..first_frame_end], &mut opened)
            .unwrap_err();
        assert!(matches!(err, DrError::Encryption(_)));
    }

    #[test]
    fn test_same_plaintext_encrypts_differently() {
        let enc = PassphraseEncryptor::new("pw");
        let mut a = Vec::new();
        let mut b = Vec::new();
        enc.encrypt_stream(&b"same"[..], &mut a).unwrap();
        enc.encrypt_stream(&b"same"[..], &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_roundtrip_and_cleanup_on_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let plain = dir.path().join("a.dra");
        let sealed = dir.path().join("a.dra.enc");
        let opened = dir.path().join("a.out");
        fs::write(&plain, b"zstd archive bytes")?;

        let enc = PassphraseEncryptor::new("pw");
        enc.encrypt(&plain, &sealed)?;
        enc.decrypt(&sealed, &opened)?;
        assert_eq!(fs::read(&opened)?, b"zstd archive bytes");

        let failed = dir.path().join("b.out");
        assert!(PassphraseEncryptor::new("other").decrypt(&sealed, &failed).is_err());
        assert!(!failed.exists());
        Ok(())
    }
}
