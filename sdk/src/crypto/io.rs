use {
    crate::crypto::EncryptionConfig,
    aes::Aes256,
    anyhow::{Result, bail, format_err},
    bytes::Bytes,
    cadd::prelude::IntoType,
    cbc::cipher::{
        BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
        generic_array::GenericArray,
    },
    cloakfs_protocol::ByteStream,
    futures::{StreamExt, TryStreamExt},
    std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    stream_generator::generate_try_stream,
};

const BLOCK_LEN: usize = 16;

/// Incremental CBC encryption. Chunks of any size are accepted;
/// only whole blocks are emitted until [`finalize`](Self::finalize).
pub struct StreamEncryptor {
    cipher: cbc::Encryptor<Aes256>,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    #[must_use]
    #[inline]
    pub fn new(key: &[u8; 32], iv: &[u8; BLOCK_LEN]) -> Self {
        Self {
            cipher: cbc::Encryptor::new(&(*key).into(), &(*iv).into()),
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let full = self.pending.len() / BLOCK_LEN * BLOCK_LEN;
        let mut out: Vec<u8> = self.pending.drain(..full).collect();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Encrypts the remaining bytes and the PKCS#7 padding.
    #[must_use]
    #[inline]
    pub fn finalize(self) -> Vec<u8> {
        self.cipher.encrypt_padded_vec_mut::<Pkcs7>(&self.pending)
    }
}

/// Incremental CBC decryption. The last block is held back until
/// [`finalize`](Self::finalize) because it carries the padding.
pub struct StreamDecryptor {
    cipher: cbc::Decryptor<Aes256>,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    #[must_use]
    #[inline]
    pub fn new(key: &[u8; 32], iv: &[u8; BLOCK_LEN]) -> Self {
        Self {
            cipher: cbc::Decryptor::new(&(*key).into(), &(*iv).into()),
            pending: Vec::new(),
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let full = self.pending.len().saturating_sub(1) / BLOCK_LEN * BLOCK_LEN;
        let mut out: Vec<u8> = self.pending.drain(..full).collect();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    #[inline]
    pub fn finalize(self) -> Result<Vec<u8>> {
        if self.pending.len() != BLOCK_LEN {
            bail!("truncated ciphertext");
        }
        self.cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&self.pending)
            .map_err(|_| format_err!("invalid ciphertext padding"))
    }
}

/// Encrypts `source` on the fly. `counter` receives the number of plaintext bytes consumed.
#[must_use]
#[inline]
pub fn encrypt_stream(
    config: &EncryptionConfig,
    mut source: ByteStream,
    counter: Arc<AtomicU64>,
) -> ByteStream {
    let mut encryptor = config.encryptor();
    generate_try_stream(move |mut y| async move {
        while let Some(chunk) = source.try_next().await? {
            counter.fetch_add(chunk.len().try_into_type::<u64>()?, Ordering::Relaxed);
            let out = encryptor.update(&chunk);
            if !out.is_empty() {
                y.send(Ok(Bytes::from(out))).await;
            }
        }
        y.send(Ok(Bytes::from(encryptor.finalize()))).await;
        Ok::<_, anyhow::Error>(())
    })
    .boxed()
}

/// Decrypts `source` on the fly. A corrupted or truncated input
/// ends the stream with an error.
#[must_use]
#[inline]
pub fn decrypt_stream(config: &EncryptionConfig, mut source: ByteStream) -> ByteStream {
    let mut decryptor = config.decryptor();
    generate_try_stream(move |mut y| async move {
        while let Some(chunk) = source.try_next().await? {
            let out = decryptor.update(&chunk);
            if !out.is_empty() {
                y.send(Ok(Bytes::from(out))).await;
            }
        }
        let last = decryptor.finalize()?;
        if !last.is_empty() {
            y.send(Ok(Bytes::from(last))).await;
        }
        Ok::<_, anyhow::Error>(())
    })
    .boxed()
}
