//! Length-prefixed `bincode` framing over `tokio` TCP streams.
//!
//! The logical protocol (§6A of the design) deliberately leaves wire
//! encoding unspecified; this is the one concrete choice this
//! implementation makes. Nothing above this module knows or cares that
//! frames are length-prefixed `bincode` — a future revision could swap
//! the codec here without touching `master`, `cloner` or `bridge`.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Largest frame this implementation will allocate a buffer for. A
/// snapshot of a very large store is still a handful of megabytes at
/// most for the key/value sizes this store supports; this just guards
/// against treating a corrupt length prefix as a memory-exhaustion
/// vector.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub async fn write_frame<T: Serialize>(writer: &mut OwnedWriteHalf, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let len = u32::try_from(bytes.len()).map_err(|_| Error::Codec(Box::new(bincode::ErrorKind::SizeLimit)))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads one frame, or `None` on a clean EOF before any bytes of a new
/// frame arrive (the normal way a peer signals it is done).
pub async fn read_frame<T: DeserializeOwned>(reader: &mut OwnedReadHalf) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Codec(Box::new(bincode::ErrorKind::SizeLimit)));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let value = bincode::deserialize(&buf)?;
    Ok(Some(value))
}
