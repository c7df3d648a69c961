//! Frame Codec (C1): outbound EOT framing, inbound newline framing.
//!
//! This is a pure parser — it never touches a socket. [`crate::connection`]
//! owns the I/O and calls into this module to turn bytes into frames and
//! commands into bytes.

use crate::error::{DriverError, Result};

/// The end-of-transmission byte terminating every outbound command.
pub const EOT: u8 = 0x04;

/// Encodes `command` into its outbound wire form: the UTF-8 bytes followed
/// by a single `EOT` byte. Rejects commands containing an embedded `EOT`,
/// since the protocol has no escaping mechanism for it.
pub fn encode_command(command: &str) -> Result<Vec<u8>> {
    if command.as_bytes().contains(&EOT) {
        return Err(DriverError::ProtocolViolation(
            "command contains an embedded EOT (0x04) byte".to_string(),
        ));
    }
    let mut buf = Vec::with_capacity(command.len() + 1);
    buf.extend_from_slice(command.as_bytes());
    buf.push(EOT);
    Ok(buf)
}

/// Accumulates inbound bytes and splits them into newline-terminated frames.
///
/// Each call to [`FrameAccumulator::push`] feeds the accumulator one read's
/// worth of bytes; [`FrameAccumulator::next_frame`] drains at most one
/// complete frame, trimmed of surrounding whitespace. The accumulator never
/// performs I/O itself.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
}

impl FrameAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends freshly read bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the first complete (`\n`-terminated) frame in the
    /// buffer, if one is present, trimmed of surrounding whitespace.
    /// Remaining bytes (a partial next frame) stay buffered.
    pub fn next_frame(&mut self) -> Option<String> {
        let newline_pos = self.buf.iter().position(|&b| b == b'\n')?;
        let frame_bytes: Vec<u8> = self.buf.drain(..=newline_pos).collect();
        let frame = String::from_utf8_lossy(&frame_bytes[..frame_bytes.len() - 1]);
        Some(frame.trim().to_string())
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trip_encode_then_split_preserves_payload(
            s in "[^\u{4}]{0,200}"
        ) {
            let encoded = encode_command(&s).unwrap();
            prop_assert_eq!(encoded.last().copied(), Some(EOT));
            prop_assert_eq!(&encoded[..encoded.len() - 1], s.as_bytes());
        }

        #[test]
        fn accumulator_never_emits_a_frame_without_consuming_its_newline(
            chunks in proptest::collection::vec("[^\n]{0,20}", 0..10)
        ) {
            let mut acc = FrameAccumulator::new();
            for chunk in &chunks {
                acc.push(chunk.as_bytes());
                acc.push(b"\n");
            }
            let mut frames = 0;
            while acc.next_frame().is_some() {
                frames += 1;
            }
            prop_assert_eq!(frames, chunks.len());
            prop_assert!(acc.is_empty());
        }
    }
}
