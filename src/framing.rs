//! Byte-stream framing for the companion-computer serial link.
//!
//! Frames are recognised one byte at a time so the decoder can be fed from
//! a receive interrupt, a DMA half-buffer or a socket read alike. Partial
//! frames survive across calls; corrupted frames are dropped and the decoder
//! goes back to hunting for the `0xAA` lead byte.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    CommandPacket, PacketKind, ProtocolError, TelemetryPacket, MAX_FRAME_LEN, SYNC_BYTE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingSync1,
    AwaitingTypeByte,
    Accumulating { expected_len: usize, kind: PacketKind },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryPacket),
    Command(CommandPacket),
}

impl Frame {
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match self {
            Frame::Telemetry(_) => PacketKind::Telemetry,
            Frame::Command(_) => PacketKind::Command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("{kind:?} frame dropped: checksum 0x{computed:04X} != embedded 0x{embedded:04X}")]
    Checksum {
        kind: PacketKind,
        computed: u16,
        embedded: u16,
    },
    #[error("{kind:?} frame dropped: {source}")]
    Malformed {
        kind: PacketKind,
        #[source]
        source: ProtocolError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    pub telemetry_frames: u32,
    pub command_frames: u32,
    pub checksum_failures: u32,
    pub malformed_frames: u32,
    pub bytes_discarded: u32,
}

/// Incremental frame decoder. Holds at most one partial frame.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    buffer: Vec<u8, MAX_FRAME_LEN>,
    stats: FrameStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingSync1,
            buffer: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Bytes of the frame currently being accumulated, sync bytes included.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitingSync1;
        self.buffer.clear();
    }

    /// Lazily decodes `bytes`. Frames left incomplete at the end of the
    /// slice are resumed on the next call.
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Frames<'a> {
        Frames {
            decoder: self,
            bytes: bytes.iter(),
        }
    }

    /// Feeds one byte. Returns a result only when a frame completes.
    pub fn push_byte(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        match self.state {
            DecoderState::AwaitingSync1 => {
                if byte == SYNC_BYTE {
                    self.buffer.clear();
                    self.buffer.push(byte).ok();
                    self.state = DecoderState::AwaitingTypeByte;
                } else {
                    self.stats.bytes_discarded = self.stats.bytes_discarded.saturating_add(1);
                }
                None
            }
            DecoderState::AwaitingTypeByte => {
                let framed = PacketKind::from_type_byte(byte)
                    .and_then(|kind| kind.frame_len().map(|len| (kind, len)));
                match framed {
                    Some((kind, expected_len)) => {
                        self.buffer.push(byte).ok();
                        self.state = DecoderState::Accumulating { expected_len, kind };
                        None
                    }
                    None => {
                        // The lead byte is lost; the rejected byte gets a
                        // fresh look as a possible lead byte.
                        self.stats.bytes_discarded = self.stats.bytes_discarded.saturating_add(1);
                        self.reset();
                        self.push_byte(byte)
                    }
                }
            }
            DecoderState::Accumulating { expected_len, kind } => {
                if self.buffer.push(byte).is_err() {
                    // Unreachable while expected_len <= MAX_FRAME_LEN.
                    self.stats.malformed_frames = self.stats.malformed_frames.saturating_add(1);
                    self.reset();
                    return None;
                }
                if self.buffer.len() < expected_len {
                    return None;
                }
                let result = self.complete(kind);
                self.reset();
                Some(result)
            }
        }
    }

    fn complete(&mut self, kind: PacketKind) -> Result<Frame, FrameError> {
        let decoded = match kind {
            PacketKind::Telemetry => TelemetryPacket::from_frame(&self.buffer).map(Frame::Telemetry),
            _ => CommandPacket::from_frame(&self.buffer).map(Frame::Command),
        };

        match decoded {
            Ok(frame) => {
                match frame {
                    Frame::Telemetry(_) => self.stats.telemetry_frames = self.stats.telemetry_frames.wrapping_add(1),
                    Frame::Command(_) => self.stats.command_frames = self.stats.command_frames.wrapping_add(1),
                }
                tracing::trace!(?kind, len = self.buffer.len(), "frame complete");
                Ok(frame)
            }
            Err(ProtocolError::BadChecksum { computed, embedded }) => {
                self.stats.checksum_failures = self.stats.checksum_failures.saturating_add(1);
                Err(FrameError::Checksum { kind, computed, embedded })
            }
            Err(source) => {
                self.stats.malformed_frames = self.stats.malformed_frames.saturating_add(1);
                Err(FrameError::Malformed { kind, source })
            }
        }
    }
}

/// Iterator returned by [`FrameDecoder::decode`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    bytes: core::slice::Iter<'a, u8>,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        for &byte in self.bytes.by_ref() {
            if let Some(result) = self.decoder.push_byte(byte) {
                return Some(result);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandId, COMMAND_FRAME_LEN, TELEMETRY_FRAME_LEN};

    fn ping_frame(seq: u16) -> [u8; COMMAND_FRAME_LEN] {
        CommandPacket::new(CommandId::Ping, seq, &[]).unwrap().to_frame()
    }

    #[test]
    fn test_state_walk_through_sync_and_type() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.state(), DecoderState::AwaitingSync1);

        assert!(decoder.push_byte(0xAA).is_none());
        assert_eq!(decoder.state(), DecoderState::AwaitingTypeByte);

        assert!(decoder.push_byte(0x56).is_none());
        assert_eq!(
            decoder.state(),
            DecoderState::Accumulating {
                expected_len: COMMAND_FRAME_LEN,
                kind: PacketKind::Command
            }
        );
        assert_eq!(decoder.pending(), &[0xAA, 0x56]);
    }

    #[test]
    fn test_telemetry_type_byte_selects_telemetry_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push_byte(0xAA);
        decoder.push_byte(0x55);
        assert_eq!(
            decoder.state(),
            DecoderState::Accumulating {
                expected_len: TELEMETRY_FRAME_LEN,
                kind: PacketKind::Telemetry
            }
        );
    }

    #[test]
    fn test_noise_is_discarded() {
        let mut decoder = FrameDecoder::new();
        for b in [0x00, 0x13, 0x55, 0x56, 0xFF] {
            assert!(decoder.push_byte(b).is_none());
        }
        assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
        assert_eq!(decoder.stats().bytes_discarded, 5);
    }

    #[test]
    fn test_unknown_type_byte_resets() {
        let mut decoder = FrameDecoder::new();
        decoder.push_byte(0xAA);
        decoder.push_byte(0x59);
        assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_repeated_lead_byte_keeps_hunting() {
        let mut decoder = FrameDecoder::new();
        decoder.push_byte(0xAA);
        decoder.push_byte(0xAA);
        assert_eq!(decoder.state(), DecoderState::AwaitingTypeByte);
        decoder.push_byte(0x56);
        assert!(matches!(decoder.state(), DecoderState::Accumulating { .. }));
    }

    #[test]
    fn test_frame_split_across_calls() {
        let frame = ping_frame(7);
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.decode(&frame[..30]).count(), 0);
        let frames: std::vec::Vec<_> = decoder.decode(&frame[30..]).collect();
        assert_eq!(frames.len(), 1);
        match frames[0] {
            Ok(Frame::Command(cmd)) => assert_eq!(cmd.sequence_number, 7),
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
    }

    #[test]
    fn test_checksum_failure_clears_buffer() {
        let mut frame = ping_frame(1);
        frame[10] ^= 0xFF;
        let mut decoder = FrameDecoder::new();

        let results: std::vec::Vec<_> = decoder.decode(&frame).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FrameError::Checksum {
                kind: PacketKind::Command,
                ..
            })
        ));
        assert_eq!(decoder.state(), DecoderState::AwaitingSync1);
        assert!(decoder.pending().is_empty());
        assert_eq!(decoder.stats().checksum_failures, 1);
    }

    #[test]
    fn test_iterator_is_lazy() {
        let mut stream = std::vec::Vec::new();
        stream.extend_from_slice(&ping_frame(1));
        stream.extend_from_slice(&ping_frame(2));

        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.decode(&stream);
        assert!(matches!(frames.next(), Some(Ok(Frame::Command(_)))));
        drop(frames);
        // Only the first frame has been consumed so far.
        assert_eq!(decoder.stats().command_frames, 1);
    }
}
