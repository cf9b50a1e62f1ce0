use {
    crate::ByteStream,
    anyhow::Result,
    bytes::{Bytes, BytesMut},
    futures::{StreamExt, TryStreamExt, future, stream},
    std::io::Read,
    tokio::{sync::mpsc, task::spawn_blocking},
    tokio_stream::wrappers::ReceiverStream,
    tracing::warn,
};

const CONTENT_CHUNK_LEN: usize = 64 * 1024;

/// Streams a blocking reader in chunks from a blocking task.
#[inline]
pub fn stream_file(mut file: impl Read + Send + 'static) -> ByteStream {
    let (tx, rx) = mpsc::channel(5);
    spawn_blocking(move || {
        let mut buf = vec![0u8; CONTENT_CHUNK_LEN];
        loop {
            match file.read(&mut buf) {
                Ok(0) => break, // end of file
                Ok(len) => {
                    let chunk = Bytes::copy_from_slice(buf.get(..len).unwrap_or_default());
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        break; // receiver closed
                    }
                }
                Err(err) => {
                    warn!(?err, "failed to read content file");
                    let _ = tx.blocking_send(Err(err.into()));
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

#[inline]
pub fn single_chunk(data: impl Into<Bytes>) -> ByteStream {
    stream::once(future::ready(Ok(data.into()))).boxed()
}

#[inline]
pub async fn collect_stream(stream: ByteStream) -> Result<Bytes> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut buf, chunk| {
            buf.extend_from_slice(&chunk);
            future::ready(Ok(buf))
        })
        .await?;
    Ok(buf.freeze())
}
