//! All content encryption uses AES-256-CBC with PKCS#7 padding.
//!
//! Cipher key and IV are derived from the user-supplied settings with SHA-256, so
//! any sufficiently long passphrase can be used as a key. If no IV is supplied,
//! it is derived from the key, so every encrypted connection has a usable,
//! deterministic IV.
//!
//! Logical paths are never stored in the backend. Instead, every path is mapped to
//! opaque backend keys with a keyed SHA-256 hash:
//!
//! - content key: `hash(path)`, holds the encrypted file content;
//! - meta key: `hash(path + " ~ META")`, holds encrypted JSON with the file size and type;
//! - dirent directory: `hash(path + "__.dirent")`, holds one pointer file per child of `path`.
//!
//! Each hash is sharded into `dir_levels` two-character directories followed by the full
//! hex digest, so that backends with per-directory limits are not overloaded.
//!
//! A pointer file is named `hash("dirent__ " + child)` and contains the encrypted
//! child path followed by a short random padding. The padding makes pointer files
//! of the same path differ between writes, which defeats dictionary attacks on
//! their content. The set of pointer files is the only source of truth about the
//! tree structure: a path exists if its parent's dirent directory has a pointer to it.

mod cipher;
mod io;

pub use {
    cipher::{
        Algorithm, EncryptionConfig, MIN_KEY_LEN, PADDING_SEPARATOR, decrypt, decrypt_str,
        encrypt, encrypt_str, normalize_iv, normalize_key, strip_padding,
    },
    io::{StreamDecryptor, StreamEncryptor, decrypt_stream, encrypt_stream},
};
