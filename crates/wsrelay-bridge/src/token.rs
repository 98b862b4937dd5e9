//! Reading token lines from the client.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use wsrelay_core::error::BridgeError;

/// Bounded, newline-delimited line reader over the client's read half.
#[derive(Debug)]
pub struct TokenReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> TokenReader<R> {
    /// `max_len` bounds one line, delimiter included.
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_len: max_len.max(1),
        }
    }

    /// The first token of a connection. EOF and blank lines are errors.
    pub async fn read_token(&mut self) -> Result<String, BridgeError> {
        match self.next_line().await? {
            None => Err(BridgeError::NoToken),
            Some(token) if token.is_empty() => Err(BridgeError::EmptyToken),
            Some(token) => Ok(token),
        }
    }

    /// Next whitespace-trimmed line; `None` on a clean EOF.
    ///
    /// Cancel safe: bytes of a partially read line are kept for the next call.
    pub async fn next_line(&mut self) -> Result<Option<String>, BridgeError> {
        loop {
            let remaining = self.max_len.saturating_sub(self.buf.len());
            if remaining == 0 {
                self.buf.clear();
                return Err(BridgeError::TokenTooLong { max: self.max_len });
            }

            let n = (&mut self.inner)
                .take(remaining as u64)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if self.buf.last() == Some(&b'\n') {
                let line = std::mem::take(&mut self.buf);
                let text = String::from_utf8(line).map_err(|_| BridgeError::MalformedToken)?;
                return Ok(Some(text.trim().to_string()));
            }

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.buf.clear();
                return Err(BridgeError::UnterminatedToken);
            }
        }
    }
}
