//! Decryption of passphrase-protected key files.
//!
//! Key files are produced by `openssl enc` with its legacy key derivation:
//! an optional `Salted__` header followed by an 8-byte salt, then the
//! ciphertext. Key and IV come from a single `EVP_BytesToKey` round.

use crate::error::{VolmountError, VolmountResult};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use sha2::Digest;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const SALT_MAGIC: &[u8] = b"Salted__";
const SALT_LEN: usize = 8;

/// Message digests accepted for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Case-insensitive registry lookup.
    pub fn from_name(name: &str) -> VolmountResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(VolmountError::UnknownDigest(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hash(self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        match self {
            DigestAlgorithm::Md5 => hash_parts::<md5::Md5>(parts),
            DigestAlgorithm::Sha1 => hash_parts::<sha1::Sha1>(parts),
            DigestAlgorithm::Sha224 => hash_parts::<sha2::Sha224>(parts),
            DigestAlgorithm::Sha256 => hash_parts::<sha2::Sha256>(parts),
            DigestAlgorithm::Sha384 => hash_parts::<sha2::Sha384>(parts),
            DigestAlgorithm::Sha512 => hash_parts::<sha2::Sha512>(parts),
        }
    }
}

fn hash_parts<D: Digest>(parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    Zeroizing::new(hasher.finalize().to_vec())
}

/// Block ciphers accepted for key files; all CBC with PKCS#7 padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Case-insensitive registry lookup.
    pub fn from_name(name: &str) -> VolmountResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-cbc" => Ok(CipherAlgorithm::Aes128Cbc),
            "aes-192-cbc" => Ok(CipherAlgorithm::Aes192Cbc),
            "aes-256-cbc" => Ok(CipherAlgorithm::Aes256Cbc),
            _ => Err(VolmountError::UnknownCipher(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Cbc => "aes-128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes-192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes-256-cbc",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        16
    }

    fn decrypt(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
        match self {
            CipherAlgorithm::Aes128Cbc => cbc_decrypt::<Aes128>(key, iv, data),
            CipherAlgorithm::Aes192Cbc => cbc_decrypt::<Aes192>(key, iv, data),
            CipherAlgorithm::Aes256Cbc => cbc_decrypt::<Aes256>(key, iv, data),
        }
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, String>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|err| format!("cipher setup failed: {err}"))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| "bad padding (wrong passphrase or digest?)".to_string())
}

/// Derived key and IV; both wiped on drop.
#[derive(Debug)]
pub struct DerivedKey {
    pub key: Zeroizing<Vec<u8>>,
    pub iv: Zeroizing<Vec<u8>>,
}

/// OpenSSL `EVP_BytesToKey` with an iteration count of one.
pub fn evp_bytes_to_key(
    digest: DigestAlgorithm,
    salt: Option<&[u8]>,
    passphrase: &[u8],
    key_len: usize,
    iv_len: usize,
) -> DerivedKey {
    let salt = salt.unwrap_or_default();
    let mut material = Zeroizing::new(Vec::with_capacity(key_len + iv_len));
    let mut previous: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::new());
    while material.len() < key_len + iv_len {
        previous = digest.hash(&[&previous[..], passphrase, salt]);
        material.extend_from_slice(&previous);
    }
    DerivedKey {
        key: Zeroizing::new(material[..key_len].to_vec()),
        iv: Zeroizing::new(material[key_len..key_len + iv_len].to_vec()),
    }
}

/// Decrypt the key file at `path` with `passphrase`.
///
/// Digest and cipher names are resolved before the file is opened.
pub fn decrypt_key_file(
    path: &Path,
    digest: &str,
    cipher: &str,
    passphrase: &[u8],
) -> VolmountResult<Zeroizing<Vec<u8>>> {
    let digest = DigestAlgorithm::from_name(digest)?;
    let cipher = CipherAlgorithm::from_name(cipher)?;
    let contents = Zeroizing::new(fs::read(path)?);
    decrypt_key_bytes(path, &contents, digest, cipher, passphrase)
}

/// Decrypt key material already in memory. `origin` is only used in errors.
pub fn decrypt_key_bytes(
    origin: &Path,
    contents: &[u8],
    digest: DigestAlgorithm,
    cipher: CipherAlgorithm,
    passphrase: &[u8],
) -> VolmountResult<Zeroizing<Vec<u8>>> {
    let (salt, ciphertext) = match contents.strip_prefix(SALT_MAGIC) {
        Some(rest) if rest.len() >= SALT_LEN => (Some(&rest[..SALT_LEN]), &rest[SALT_LEN..]),
        Some(_) => return Err(key_error(origin, "truncated salt header")),
        None => (None, contents),
    };
    if ciphertext.is_empty() {
        return Err(key_error(origin, "no ciphertext"));
    }

    let derived = evp_bytes_to_key(digest, salt, passphrase, cipher.key_len(), cipher.iv_len());
    cipher
        .decrypt(&derived.key, &derived.iv, ciphertext)
        .map(Zeroizing::new)
        .map_err(|reason| key_error(origin, reason))
}

fn key_error(path: &Path, reason: impl Into<String>) -> VolmountError {
    VolmountError::KeyDecryption {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}

/// Advisory strength of a cipher or digest name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    Blacklisted,
    Unspecified,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Blacklisted => "blacklisted",
            SecurityLevel::Unspecified => "unspecified",
        }
    }
}

const BLACKLIST: &[&str] = &["ecb", "rc2", "rc4", "des", "des3", "md2", "md4"];

/// Score a cipher/digest specification such as `aes-cbc-essiv:sha256`.
pub fn cipher_digest_security(spec: &str) -> SecurityLevel {
    let blacklisted = spec
        .split([',', '-', '.', ':', '_'])
        .filter(|token| !token.is_empty())
        .any(|token| BLACKLIST.iter().any(|bad| token.eq_ignore_ascii_case(bad)));
    if blacklisted {
        SecurityLevel::Blacklisted
    } else {
        SecurityLevel::Unspecified
    }
}
