//! Line framing for the client-facing wire format.
//!
//! Every upstream payload is written byte-for-byte, followed by the
//! configured line ending. The keepalive probe uses the same ending.

use bytes::{BufMut, Bytes, BytesMut};

use wsrelay_core::config::{BridgeConfig, LineEnding};

#[derive(Debug, Clone)]
pub struct Framer {
    line_ending: LineEnding,
    probe: Bytes,
}

impl Framer {
    pub fn new(line_ending: LineEnding, keepalive_message: &str) -> Self {
        let delimiter = line_ending.as_bytes();
        let mut probe = BytesMut::with_capacity(keepalive_message.len() + delimiter.len());
        probe.put_slice(keepalive_message.as_bytes());
        probe.put_slice(delimiter);
        Self {
            line_ending,
            probe: probe.freeze(),
        }
    }

    /// `payload` followed by the line ending.
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let delimiter = self.line_ending.as_bytes();
        let mut buf = BytesMut::with_capacity(payload.len() + delimiter.len());
        buf.put_slice(payload);
        buf.put_slice(delimiter);
        buf.freeze()
    }

    /// The framed keepalive probe.
    pub fn probe(&self) -> Bytes {
        self.probe.clone()
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }
}

impl From<&BridgeConfig> for Framer {
    fn from(config: &BridgeConfig) -> Self {
        Self::new(config.line_ending, &config.keepalive_message)
    }
}
