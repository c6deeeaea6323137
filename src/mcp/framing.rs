//! Frame codecs for stdio servers
//!
//! Two framings are in use by tool servers in the wild:
//!
//! - newline delimited JSON, one message per line (the default);
//! - `Content-Length: N\r\n\r\n` headers followed by exactly `N` bytes of
//!   JSON, as used by LSP-style servers.
//!
//! [`FrameCodec`] implements both behind `tokio_util::codec` so the stdio
//! transport can drive either with `FramedRead` / `FramedWrite`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single inbound frame. Larger frames are discarded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// How messages are delimited on the child's stdio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    NewlineDelimited,
    ContentLength,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framing::NewlineDelimited => write!(f, "newline-delimited"),
            Framing::ContentLength => write!(f, "content-length"),
        }
    }
}

/// Codec turning a byte stream into UTF-8 JSON frames and back
///
/// Decoding never fails on malformed input: bad frames are logged and
/// skipped so that one broken message cannot take down the reader.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame: usize,
    /// Newline mode: bytes already scanned without finding `\n`
    scanned: usize,
    /// Newline mode: currently skipping the rest of an oversized line
    discarding: bool,
    /// Content-Length mode: body length of the frame being read
    body_len: Option<usize>,
    /// Content-Length mode: bytes of an oversized body still to discard
    skip: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            max_frame: MAX_FRAME_BYTES,
            scanned: 0,
            discarding: false,
            body_len: None,
            skip: 0,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if self.scanned > self.max_frame && !self.discarding {
                    tracing::warn!(
                        bytes = self.scanned,
                        "dropping oversized frame from server stdout"
                    );
                    self.discarding = true;
                }
                if self.discarding {
                    src.clear();
                    self.scanned = 0;
                }
                return None;
            };

            let end = self.scanned + offset;
            let line = src.split_to(end + 1);
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }

            match std::str::from_utf8(&line[..end]) {
                Ok(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        return Some(text.to_string());
                    }
                }
                Err(e) => tracing::warn!("dropping non UTF-8 frame: {e}"),
            }
        }
    }

    fn decode_content_length(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(src.len());
                src.advance(n);
                self.skip -= n;
                if self.skip > 0 {
                    return None;
                }
            }

            if let Some(len) = self.body_len {
                if src.len() < len {
                    src.reserve(len - src.len());
                    return None;
                }
                let body = src.split_to(len);
                self.body_len = None;
                match String::from_utf8(body.to_vec()) {
                    Ok(text) => return Some(text),
                    Err(e) => {
                        tracing::warn!("dropping non UTF-8 frame: {e}");
                        continue;
                    }
                }
            }

            let header_end = src
                .windows(HEADER_TERMINATOR.len())
                .position(|w| w == HEADER_TERMINATOR)?;
            let header = src.split_to(header_end);
            src.advance(HEADER_TERMINATOR.len());

            match parse_content_length(&header) {
                Some(len) if len <= self.max_frame => self.body_len = Some(len),
                Some(len) => {
                    tracing::warn!(bytes = len, "dropping oversized frame from server stdout");
                    self.skip = len;
                }
                None => {
                    tracing::warn!("frame header without Content-Length; skipping");
                }
            }
        }
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        Ok(match self.framing {
            Framing::NewlineDelimited => self.decode_line(src),
            Framing::ContentLength => self.decode_content_length(src),
        })
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.framing == Framing::NewlineDelimited && !src.is_empty() && !self.discarding {
            // Final line without a trailing newline
            let rest = src.split_to(src.len());
            self.scanned = 0;
            if let Ok(text) = std::str::from_utf8(&rest) {
                let text = text.trim();
                if !text.is_empty() {
                    return Ok(Some(text.to_string()));
                }
            }
        }
        src.clear();
        Ok(None)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.framing {
            Framing::NewlineDelimited => {
                if item.contains('\n') {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "newline-delimited frame contains a newline",
                    ));
                }
                dst.reserve(item.len() + 1);
                dst.put_slice(item.as_bytes());
                dst.put_u8(b'\n');
            }
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", item.len());
                dst.reserve(header.len() + item.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(item.as_bytes());
            }
        }
        Ok(())
    }
}
