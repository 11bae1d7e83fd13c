// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming decoders for the collector input.
//!
//! journald emits one JSON object per entry, but nothing guarantees an object sits on a
//! single line (pretty printed dumps are common in tests and replays). [`RecordCodec`]
//! therefore parses self-delimited JSON objects straight out of the read buffer and
//! only asks for more bytes when the object in front of it is incomplete.
//!
//! An incomplete object is scanned for its closing brace as bytes arrive, and only
//! re-parsed once that brace shows up or the buffer has doubled since the last attempt.
//! A large object trickling in over many reads is therefore parsed a logarithmic number
//! of times, while syntax errors still surface on first sight.
//!
//! Both codecs plug into [`tokio_util::codec::FramedRead`], whose `next()` is cancel
//! safe, so the forwarder can race the decoder against its flush deadline.

use bytes::{Buf, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec};
use tracing::warn;

use crate::constants::MAX_UNIT_SIZE_BYTES;
use crate::error::DecodeError;
use crate::record::Record;

/// What to do with a unit that does not decode as a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Surface a [`DecodeError`] and end the stream.
    #[default]
    Abort,
    /// Log the unit, drop everything up to the next newline and keep going.
    Skip,
}

/// Decodes a byte stream into [`Record`]s, one JSON object at a time.
#[derive(Debug)]
pub struct RecordCodec {
    policy: MalformedPolicy,
    max_unit_size: usize,
    // set after a skipped unit until the next newline shows up
    discarding: bool,
    skipped: u64,
    scan: ObjectScan,
}

/// Progress through the object at the front of the buffer, kept across reads.
#[derive(Debug, Default)]
struct ObjectScan {
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    // buffer length at the last parse that ran out of input
    parsed_len: usize,
}

impl ObjectScan {
    /// Continues scanning `buf` where the previous call stopped. Returns true once the
    /// bracket opened by `buf[0]` is closed.
    fn closes(&mut self, buf: &[u8]) -> bool {
        for (i, &b) in buf.iter().enumerate().skip(self.scanned) {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        self.scanned = i + 1;
                        return true;
                    }
                }
                _ => {}
            }
        }
        self.scanned = buf.len();
        false
    }

    fn parse_due(&self, len: usize) -> bool {
        len >= self.parsed_len.saturating_mul(2)
    }
}

impl RecordCodec {
    #[must_use]
    pub fn new(policy: MalformedPolicy) -> Self {
        Self::with_max_unit_size(policy, MAX_UNIT_SIZE_BYTES)
    }

    #[must_use]
    pub fn with_max_unit_size(policy: MalformedPolicy, max_unit_size: usize) -> Self {
        RecordCodec {
            policy,
            max_unit_size,
            discarding: false,
            skipped: 0,
            scan: ObjectScan::default(),
        }
    }

    /// Number of units dropped under [`MalformedPolicy::Skip`].
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn reject(&mut self, src: &mut BytesMut, err: DecodeError) -> Result<(), DecodeError> {
        self.scan = ObjectScan::default();
        match self.policy {
            MalformedPolicy::Abort => Err(err),
            MalformedPolicy::Skip => {
                self.skipped += 1;
                warn!("DECODER | Skipping malformed input unit: {err}");
                self.discarding = true;
                discard_line(src, &mut self.discarding);
                Ok(())
            }
        }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(MalformedPolicy::default())
    }
}

/// Drops bytes up to and including the next newline. Clears `discarding` once found.
fn discard_line(src: &mut BytesMut, discarding: &mut bool) {
    match src.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            src.advance(pos + 1);
            *discarding = false;
        }
        None => src.clear(),
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        loop {
            if self.discarding {
                discard_line(src, &mut self.discarding);
                if self.discarding {
                    return Ok(None);
                }
            }

            match src.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(start) => src.advance(start),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            // only objects can be scanned ahead; anything else is parsed right away and
            // fails as malformed
            let complete = src[0] != b'{' || self.scan.closes(&src[..]);
            if !complete && !self.scan.parse_due(src.len()) {
                if src.len() > self.max_unit_size {
                    self.reject(src, DecodeError::TooLarge(self.max_unit_size))?;
                    continue;
                }
                return Ok(None);
            }

            let (next, consumed) = {
                let mut stream =
                    serde_json::Deserializer::from_slice(&src[..]).into_iter::<Record>();
                let next = stream.next();
                (next, stream.byte_offset())
            };
            match next {
                Some(Ok(record)) => {
                    src.advance(consumed);
                    self.scan = ObjectScan::default();
                    return Ok(Some(record));
                }
                Some(Err(e)) if e.is_eof() => {
                    self.scan.parsed_len = src.len();
                    if src.len() > self.max_unit_size {
                        self.reject(src, DecodeError::TooLarge(self.max_unit_size))?;
                        continue;
                    }
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.reject(src, DecodeError::Malformed(e))?;
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Record>, DecodeError> {
        // no more bytes are coming, so whatever is buffered gets parsed
        self.scan.parsed_len = 0;
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        let left = src.len();
        match self.policy {
            MalformedPolicy::Abort => Err(DecodeError::Truncated(left)),
            MalformedPolicy::Skip => {
                self.skipped += 1;
                warn!("DECODER | Dropping {left} trailing bytes of an incomplete unit");
                src.clear();
                Ok(None)
            }
        }
    }
}

/// Reader yielding decoded JSON records.
pub fn record_reader<R: AsyncRead>(
    reader: R,
    policy: MalformedPolicy,
) -> FramedRead<R, RecordCodec> {
    FramedRead::new(reader, RecordCodec::new(policy))
}

/// Reader yielding raw newline-delimited lines, without their terminator.
pub fn line_reader<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_UNIT_SIZE_BYTES))
}
