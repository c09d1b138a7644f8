use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Symmetric cipher for passwords at rest, keyed from a file that is
/// generated on first run. Losing the key file makes every stored
/// password undecryptable; there is no recovery path.
pub struct Cipher {
    cipher: XChaCha20Poly1305,
}

impl Cipher {
    /// Loads the key file, creating it with owner-read-only permissions
    /// if it does not exist yet.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            write_new_key(path)?;
        }

        let encoded = fs::read_to_string(path)
            .with_context(|| format!("unable to read key file {}", path.display()))?;
        let key = base64::decode(encoded.trim())
            .map_err(|_| anyhow!("key file {} is corrupt", path.display()))?;
        if key.len() != KEY_LEN {
            bail!("key file {} is corrupt", path.display());
        }

        Ok(Cipher {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Encrypts a password, prepending the random nonce to the ciphertext.
    pub fn encode(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow!("unable to encrypt password"))?;

        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`Cipher::encode`].
    pub fn decode(&self, blob: &[u8]) -> Result<String> {
        if blob.len() <= NONCE_LEN {
            bail!("stored password is corrupt");
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("unable to decrypt stored password"))?;
        String::from_utf8(plaintext).context("stored password is not valid UTF-8")
    }
}

fn write_new_key(path: &Path) -> Result<()> {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    fs::write(path, base64::encode(key))
        .with_context(|| format!("unable to write key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o400))
            .with_context(|| format!("unable to restrict key file {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_in(dir: &tempfile::TempDir) -> Cipher {
        Cipher::from_key_file(&dir.path().join(".secret_key")).unwrap()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = cipher_in(&dir);
        for password in ["hunter2", "", "pa55 w0rd with spaces", "ünïcödé"] {
            let blob = cipher.encode(password).unwrap();
            assert_eq!(cipher.decode(&blob).unwrap(), password);
        }
    }

    #[test]
    fn key_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let blob = cipher_in(&dir).encode("secret").unwrap();
        // A second instance reads the same key file back.
        assert_eq!(cipher_in(&dir).decode(&blob).unwrap(), "secret");
    }

    #[test]
    fn tampered_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = cipher_in(&dir);
        let mut blob = cipher.encode("secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(cipher.decode(&blob).is_err());
    }

    #[test]
    fn truncated_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = cipher_in(&dir);
        assert!(cipher.decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn corrupt_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".secret_key");
        fs::write(&path, "not base64 at all!!!").unwrap();
        assert!(Cipher::from_key_file(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_read_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".secret_key");
        let _ = Cipher::from_key_file(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }
}
