pub mod ca;

use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use md5::Md5;
use rand::{rngs::OsRng, RngCore};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha2::{Digest, Sha256};

use crate::{C2Error, Result};

/// Fill `bytes` with cryptographically secure random data
pub fn secure_random(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
}

/// Random nonce of `n` hex characters
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n.div_ceil(2)];
    secure_random(&mut buf);
    let mut s = hex::encode(buf);
    s.truncate(n);
    s
}

pub fn sha256_sum_raw(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_sum(text: &str) -> String {
    sha256_sum_raw(text.as_bytes())
}

/// SHA-256 of a file of any size, streamed in 64 KiB chunks
pub fn sha256_sum_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn md5_sum(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

pub fn base64url_decode(text: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(text)
        .map_err(|e| C2Error::Crypto(format!("base64url decode: {e}")))
}

/// PBKDF2-SHA1 derivation used by the KCP transport
pub fn pbkdf2_sha1(password: &[u8], salt: &[u8], rounds: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password, salt, rounds, &mut out);
    out
}

/// Symmetric sealed box shared with agents. The key is derived from the
/// per-build magic string, which also doubles as associated data.
pub struct MagicBox {
    key: LessSafeKey,
    aad: Vec<u8>,
}

impl MagicBox {
    pub fn new(magic: &str) -> Result<Self> {
        let key_bytes = Sha256::digest(magic.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_slice())
            .map_err(|_| C2Error::Crypto("AES key setup failed".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            aad: magic.as_bytes().to_vec(),
        })
    }

    /// `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        secure_random(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(&self.aad), &mut in_out)
            .map_err(|_| C2Error::Crypto("encryption failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);
        Ok(result)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + 16 {
            return Err(C2Error::Crypto("sealed box too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| C2Error::Crypto("bad nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(&self.aad), &mut in_out)
            .map_err(|_| C2Error::Crypto("decryption failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes() {
        assert_eq!(
            sha256_sum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(md5_sum(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn sha256_file_matches_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello emp3r0r").unwrap();
        assert_eq!(
            sha256_sum_file(&path).unwrap(),
            sha256_sum_raw(b"hello emp3r0r")
        );
    }

    #[test]
    fn base64url_roundtrip() {
        let data = b"\xff\xfe subject?";
        let encoded = base64url_encode(data);
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(base64url_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn random_hex_length() {
        let nonce = random_hex(16);
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, random_hex(16));
    }

    #[test]
    fn sealed_box_roundtrip() {
        let magic = "64781530-1475-4cf8-950c-dcdf4c619dbc";
        let mbox = MagicBox::new(magic).unwrap();
        let sealed = mbox.seal(b"exfil").unwrap();
        assert_eq!(mbox.open(&sealed).unwrap(), b"exfil");

        // a box keyed from another magic must not open it
        let other = MagicBox::new("another-magic").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn pbkdf2_vector() {
        // RFC 6070 test vector
        let derived = pbkdf2_sha1(b"password", b"salt", 2, 20);
        assert_eq!(hex::encode(derived), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
    }
}
