//! Line-oriented AEAD stream established by a completed handshake.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::crypto::{GroupCipher, GroupKey};
use crate::error::{NodeError, NodeResult};

/// Upper bound for one line on the wire, encrypted or not, terminator excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Read one `\n`-terminated line without the terminator.
///
/// Returns `None` at end of stream.
pub(crate) async fn read_raw_line<R>(reader: &mut R) -> NodeResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 2)
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    if trimmed > MAX_LINE_LEN {
        return Err(NodeError::Transport(format!(
            "Line exceeds {} bytes",
            MAX_LINE_LEN
        )));
    }
    line.truncate(trimmed);
    Ok(Some(line))
}

pub(crate) async fn write_raw_line<W>(writer: &mut W, line: &str) -> NodeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer
        .write_all(&buf)
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NodeError::Transport(e.to_string()))
}

/// Encrypted line transport over a raw byte stream.
///
/// Each line is sealed independently with the session key and sent as base64.
pub struct EncryptedStream<S> {
    inner: BufReader<S>,
    cipher: GroupCipher,
}

impl<S> EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(inner: BufReader<S>, session_key: &GroupKey) -> Self {
        Self {
            inner,
            cipher: GroupCipher::new(session_key),
        }
    }

    /// Encrypt and send one line.
    pub async fn write_line(&mut self, line: &str) -> NodeResult<()> {
        let blob = self.cipher.encrypt_to_base64(line.as_bytes())?;
        write_raw_line(self.inner.get_mut(), &blob).await
    }

    /// Receive and decrypt one line.
    ///
    /// `None` at end of stream. A line that fails authentication is an error
    /// and no part of its plaintext is returned.
    pub async fn read_line(&mut self) -> NodeResult<Option<String>> {
        let Some(blob) = read_raw_line(&mut self.inner).await? else {
            return Ok(None);
        };
        let plain = self.cipher.decrypt_base64(&blob)?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|e| NodeError::MalformedMessage(format!("Line is not UTF-8: {}", e)))
    }

    /// Flush and shut down the write half.
    pub async fn shutdown(mut self) -> NodeResult<()> {
        self.inner
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))
    }
}
