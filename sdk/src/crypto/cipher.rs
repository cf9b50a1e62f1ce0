use {
    crate::crypto::io::{StreamDecryptor, StreamEncryptor},
    anyhow::{Context as _, Result, bail, format_err},
    base64::{Engine, prelude::BASE64_STANDARD},
    cloakfs_protocol::{LogicalPath, settings::EncryptionSettings},
    derivative::Derivative,
    derive_more::Display,
    rand::{
        Rng,
        distr::{Alphanumeric, SampleString},
    },
    sha2::{Digest, Sha256},
    std::{str::FromStr, sync::Once},
    tracing::warn,
};

/// Keys shorter than this (after trimming) are rejected.
pub const MIN_KEY_LEN: usize = 16;
pub const DEFAULT_DIR_LEVELS: usize = 4;
pub const DEFAULT_META_WORKERS: usize = 4;
/// Separates the path from the random padding in pointer files.
pub const PADDING_SEPARATOR: &str = " ~ ";

const META_SUFFIX: &str = " ~ META";
const DIRENT_DIR_SUFFIX: &str = "__.dirent";
const DIRENT_FILE_PREFIX: &str = "dirent__ ";
const IV_LEN: usize = 16;
/// A SHA-256 hex digest only has 32 two-character segments.
const MAX_DIR_LEVELS: usize = 32;
/// Suppresses the warning about disabled encryption.
const IGNORE_DISABLED_ENCRYPTION_ENV: &str = "CLOAKFS_IGNORE_DISABLED_ENCRYPTION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Algorithm {
    #[display("aes-256-cbc")]
    Aes256Cbc,
}

impl FromStr for Algorithm {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-cbc" | "aes256cbc" => Ok(Self::Aes256Cbc),
            other => bail!("unsupported encryption algorithm `{other}`"),
        }
    }
}

/// Encryption parameters of a connection. Created once, never mutated.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct EncryptionConfig {
    #[derivative(Debug = "ignore")]
    key: [u8; 32],
    #[derivative(Debug = "ignore")]
    iv: [u8; IV_LEN],
    algorithm: Algorithm,
    dir_levels: usize,
    meta_workers: usize,
}

/// Hashes a trimmed key string into a 32-byte cipher key.
/// Returns `None` if the key is too short.
#[must_use]
#[inline]
pub fn normalize_key(key: &str) -> Option<[u8; 32]> {
    let key = key.trim();
    if key.chars().count() < MIN_KEY_LEN {
        return None;
    }
    Some(Sha256::digest(key.as_bytes()).into())
}

/// Hashes the IV string into a 16-byte IV, or derives the IV from the
/// normalized key if no usable IV string is supplied.
#[must_use]
#[inline]
pub fn normalize_iv(iv: Option<&str>, key: &[u8; 32]) -> [u8; IV_LEN] {
    let digest = match iv.map(str::trim) {
        Some(iv) if iv.chars().count() >= IV_LEN => Sha256::digest(iv.as_bytes()),
        _ => Sha256::digest(key),
    };
    let mut out = [0; IV_LEN];
    out.copy_from_slice(digest.get(..IV_LEN).unwrap_or_default());
    out
}

impl EncryptionConfig {
    #[inline]
    pub fn from_settings(settings: &EncryptionSettings) -> Result<Self> {
        let key = normalize_key(&settings.key).context("invalid encryption key")?;
        let iv = normalize_iv(settings.iv.as_deref(), &key);
        let algorithm = settings
            .algorithm
            .as_deref()
            .map(Algorithm::from_str)
            .transpose()?
            .unwrap_or(Algorithm::Aes256Cbc);
        let dir_levels = settings.dir_levels.unwrap_or(DEFAULT_DIR_LEVELS);
        if dir_levels > MAX_DIR_LEVELS {
            bail!("dir_levels must not exceed {MAX_DIR_LEVELS}, got {dir_levels}");
        }
        let meta_workers = match settings.meta_workers {
            Some(0) => bail!("meta_workers must be at least 1"),
            Some(n) => n,
            None => DEFAULT_META_WORKERS,
        };
        Ok(Self {
            key,
            iv,
            algorithm,
            dir_levels,
            meta_workers,
        })
    }

    #[must_use]
    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[must_use]
    #[inline]
    pub fn dir_levels(&self) -> usize {
        self.dir_levels
    }

    #[must_use]
    #[inline]
    pub fn meta_workers(&self) -> usize {
        self.meta_workers
    }

    #[must_use]
    #[inline]
    pub fn encryptor(&self) -> StreamEncryptor {
        match self.algorithm {
            Algorithm::Aes256Cbc => StreamEncryptor::new(&self.key, &self.iv),
        }
    }

    #[must_use]
    #[inline]
    pub fn decryptor(&self) -> StreamDecryptor {
        match self.algorithm {
            Algorithm::Aes256Cbc => StreamDecryptor::new(&self.key, &self.iv),
        }
    }

    /// Random suffix appended to pointer file contents.
    #[must_use]
    #[inline]
    pub fn path_padding(&self) -> String {
        let mut rng = rand::rng();
        let len = rng.random_range(1..=2_usize);
        format!(
            "{PADDING_SEPARATOR}{}",
            Alphanumeric.sample_string(&mut rng, len)
        )
    }

    fn keyed_hash(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(b" ");
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn sharded(&self, hash: &str) -> String {
        let mut out = String::new();
        for segment in hash.as_bytes().chunks(2).take(self.dir_levels) {
            out.push_str(std::str::from_utf8(segment).unwrap_or_default());
            out.push('/');
        }
        out.push_str(hash);
        out
    }

    /// Backend key of arbitrary plaintext, sharded into `dir_levels` directories.
    #[must_use]
    #[inline]
    pub fn encrypt_key(&self, plaintext: &str) -> String {
        self.sharded(&self.keyed_hash(&[plaintext]))
    }

    /// Content key of `path`.
    #[must_use]
    #[inline]
    pub fn encrypt_path(&self, path: &LogicalPath) -> String {
        self.encrypt_key(path.as_str())
    }

    /// Key of the encrypted size/type record of `path`.
    #[must_use]
    #[inline]
    pub fn meta_path(&self, path: &LogicalPath) -> String {
        self.sharded(&self.keyed_hash(&[path.as_str(), META_SUFFIX]))
    }

    /// Key of the directory holding pointer files for the children of `path`.
    #[must_use]
    #[inline]
    pub fn dirent_dir(&self, path: &LogicalPath) -> String {
        self.sharded(&self.keyed_hash(&[path.as_str(), DIRENT_DIR_SUFFIX]))
    }

    /// Key of the pointer file for `path` inside `dirent_dir`.
    #[must_use]
    #[inline]
    pub fn dirent_file(&self, dirent_dir: &str, path: &LogicalPath) -> String {
        format!(
            "{dirent_dir}/{}",
            self.keyed_hash(&[DIRENT_FILE_PREFIX, path.as_str()])
        )
    }
}

static WARN_PLAINTEXT: Once = Once::new();

fn warn_plaintext() {
    if std::env::var_os(IGNORE_DISABLED_ENCRYPTION_ENV).is_none() {
        WARN_PLAINTEXT.call_once(|| {
            warn!("no encryption key configured, encryption is DISABLED");
        });
    }
}

/// Encrypts a short value at once. Without a config, returns `plaintext` unchanged.
#[must_use]
#[inline]
pub fn encrypt(plaintext: &[u8], config: Option<&EncryptionConfig>) -> Vec<u8> {
    let Some(config) = config else {
        warn_plaintext();
        return plaintext.to_vec();
    };
    let mut encryptor = config.encryptor();
    let mut out = encryptor.update(plaintext);
    out.extend(encryptor.finalize());
    out
}

/// Decrypts a short value at once. Without a config, returns `ciphertext` unchanged.
#[inline]
pub fn decrypt(ciphertext: &[u8], config: Option<&EncryptionConfig>) -> Result<Vec<u8>> {
    let Some(config) = config else {
        return Ok(ciphertext.to_vec());
    };
    let mut decryptor = config.decryptor();
    let mut out = decryptor.update(ciphertext);
    out.extend(decryptor.finalize()?);
    Ok(out)
}

/// Encrypts a string into base64 text.
#[must_use]
#[inline]
pub fn encrypt_str(value: &str, config: Option<&EncryptionConfig>) -> String {
    if config.is_none() {
        warn_plaintext();
        return value.to_owned();
    }
    BASE64_STANDARD.encode(encrypt(value.as_bytes(), config))
}

#[inline]
pub fn decrypt_str(value: &str, config: Option<&EncryptionConfig>) -> Result<String> {
    if config.is_none() {
        return Ok(value.to_owned());
    }
    let ciphertext = BASE64_STANDARD
        .decode(value.trim())
        .context("invalid base64 in encrypted value")?;
    let plaintext = decrypt(&ciphertext, config)?;
    String::from_utf8(plaintext).map_err(|err| format_err!("decrypted value is not UTF-8: {err}"))
}

/// Removes the random padding from decrypted pointer file content.
#[must_use]
#[inline]
pub fn strip_padding(value: &str) -> &str {
    value
        .rsplit_once(PADDING_SEPARATOR)
        .map_or(value, |(path, _padding)| path)
}
