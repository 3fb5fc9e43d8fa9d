//! NUL-terminated messages over tokio streams
//!
//! Async counterpart of `relay_protocol::{read_message, write_message}`, used by
//! the remote console and the test client.

use relay_protocol::MAX_MESSAGE_LEN;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one message. `Ok(None)` means the peer closed the stream.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_MESSAGE_LEN as u64 + 1)
        .read_until(0, &mut buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&0) {
        buf.pop();
    } else if buf.len() > MAX_MESSAGE_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too long"));
    } else {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed mid-message",
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(&[0]).await?;
    writer.flush().await
}
