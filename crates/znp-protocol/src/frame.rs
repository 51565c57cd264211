//! MT frame structure and the streaming reframer
//!
//! Transport frame format:
//! ```text
//! [SOF: 0xFE]
//! [Length: 1 byte] (payload only, max 250)
//! [Command header: 2 bytes LE]
//! [Payload: variable]
//! [FCS: 1 byte] (XOR over length, header and payload)
//! ```

use crate::codec::{Codec, DecodeError};
use bytes::{Buf, BytesMut};

/// Start-of-frame marker
pub const SOF: u8 = 0xFE;

/// Largest payload that fits in a single MT frame
pub const MAX_PAYLOAD: usize = 250;

/// Shortest possible frame: SOF + length + header + FCS
const MIN_FRAME_SIZE: usize = 5;

/// MT command type, the top three bits of Cmd0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Poll = 0,
    /// Synchronous request, answered by exactly one SRSP
    Sreq = 1,
    /// Asynchronous request or callback
    Areq = 2,
    /// Synchronous response
    Srsp = 3,
    Reserved4 = 4,
    Reserved5 = 5,
    Reserved6 = 6,
    Reserved7 = 7,
}

impl CommandType {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Self::Poll,
            1 => Self::Sreq,
            2 => Self::Areq,
            3 => Self::Srsp,
            4 => Self::Reserved4,
            5 => Self::Reserved5,
            6 => Self::Reserved6,
            _ => Self::Reserved7,
        }
    }
}

/// MT subsystem, the bottom five bits of Cmd0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Subsystem {
    RpcError = 0x00,
    Sys = 0x01,
    Mac = 0x02,
    Nwk = 0x03,
    Af = 0x04,
    Zdo = 0x05,
    Sapi = 0x06,
    Util = 0x07,
    Debug = 0x08,
    App = 0x09,
    Ubl = 0x0D,
    AppConfig = 0x0F,
    Gp = 0x15,
}

/// 16-bit command header: `[Cmd0 = type:3 | subsystem:5] [CmdId: 8]`,
/// serialized little-endian so Cmd0 is the first byte on the wire.
///
/// An SREQ with header `H` is always answered by an SRSP with header
/// `H | 0x0040` (the type field goes from 1 to 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHeader(u16);

impl CommandHeader {
    #[must_use]
    pub const fn new(ty: CommandType, subsystem: Subsystem, id: u8) -> Self {
        let cmd0 = ((ty as u16) << 5) | (subsystem as u16 & 0x1F);
        Self(cmd0 | (id as u16) << 8)
    }

    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn cmd0(self) -> u8 {
        (self.0 & 0x00FF) as u8
    }

    #[must_use]
    pub fn id(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub fn command_type(self) -> CommandType {
        CommandType::from_bits(self.cmd0() >> 5)
    }

    #[must_use]
    pub fn subsystem_id(self) -> u8 {
        self.cmd0() & 0x1F
    }

    /// Header of the SRSP answering this SREQ
    #[must_use]
    pub const fn to_srsp(self) -> Self {
        Self(self.0 | 0x0040)
    }
}

impl Codec for CommandHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(u16::decode(buf)?))
    }
}

impl std::fmt::Display for CommandHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/0x{:02X}/0x{:02X}",
            self.command_type(),
            self.subsystem_id(),
            self.id()
        )
    }
}

/// A framed MT command: header plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralFrame {
    pub header: CommandHeader,
    pub payload: Vec<u8>,
}

impl GeneralFrame {
    #[must_use]
    pub fn new(header: CommandHeader, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self { header, payload }
    }

    /// Serialize with SOF and FCS, ready for the wire
    #[must_use]
    pub fn encode_transport(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(MIN_FRAME_SIZE + self.payload.len());
        data.push(SOF);
        data.push(self.payload.len() as u8);
        self.header.encode(&mut data);
        data.extend_from_slice(&self.payload);

        let fcs = xor_fcs(&data[1..]);
        data.push(fcs);
        data
    }
}

/// XOR frame check sequence over length, header and payload
#[must_use]
pub fn xor_fcs(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Incremental transport frame decoder
///
/// The line is full-duplex and may carry noise; the decoder resynchronizes
/// to the next SOF whenever the length field or the FCS is invalid, and
/// never stalls on a short garbage prefix.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
        }
    }

    /// Feed received bytes, returning every frame completed by them
    pub fn feed(&mut self, data: &[u8]) -> Vec<GeneralFrame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            // Discard anything before the next SOF
            match self.buffer.iter().position(|&b| b == SOF) {
                Some(0) => {}
                Some(index) => self.buffer.advance(index),
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            if self.buffer.len() < MIN_FRAME_SIZE {
                break;
            }

            let length = self.buffer[1] as usize;
            if length > MAX_PAYLOAD {
                // Not a real frame, drop the SOF and rescan
                tracing::debug!(length, "dropping frame candidate with invalid length");
                self.buffer.advance(1);
                continue;
            }

            if self.buffer.len() < MIN_FRAME_SIZE + length {
                break;
            }

            let fcs = xor_fcs(&self.buffer[1..4 + length]);
            if fcs != self.buffer[4 + length] {
                tracing::debug!(
                    expected = fcs,
                    actual = self.buffer[4 + length],
                    "dropping frame candidate with FCS mismatch"
                );
                self.buffer.advance(1);
                continue;
            }

            let header =
                CommandHeader(u16::from_le_bytes([self.buffer[2], self.buffer[3]]));
            let payload = self.buffer[4..4 + length].to_vec();
            self.buffer.advance(MIN_FRAME_SIZE + length);

            frames.push(GeneralFrame { header, payload });
        }

        frames
    }

    /// Drop any partially received bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_REQ: CommandHeader =
        CommandHeader::new(CommandType::Sreq, Subsystem::Sys, 0x01);

    #[test]
    fn test_header_packing() {
        assert_eq!(PING_REQ.cmd0(), 0x21);
        assert_eq!(PING_REQ.id(), 0x01);
        assert_eq!(PING_REQ.command_type(), CommandType::Sreq);
        assert_eq!(PING_REQ.subsystem_id(), 0x01);
    }

    #[test]
    fn test_srsp_header() {
        let srsp = PING_REQ.to_srsp();
        assert_eq!(srsp.cmd0(), 0x61);
        assert_eq!(srsp.command_type(), CommandType::Srsp);
        assert_eq!(srsp.id(), 0x01);
    }

    #[test]
    fn test_encode_ping() {
        let frame = GeneralFrame::new(PING_REQ, vec![]);
        assert_eq!(frame.encode_transport(), [0xFE, 0x00, 0x21, 0x01, 0x20]);
    }

    #[test]
    fn test_decode_ping_rsp() {
        // SRSP of Ping with Capabilities = CAP_SYS
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&[0xFE, 0x02, 0x61, 0x01, 0x01, 0x00, 0x63]);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, PING_REQ.to_srsp());
        assert_eq!(frames[0].payload, [0x01, 0x00]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = GeneralFrame::new(PING_REQ.to_srsp(), vec![0x01, 0x00]);
        let encoded = frame.encode_transport();

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&encoded), [frame]);
    }

    #[test]
    fn test_byte_at_a_time_matches_all_at_once() {
        let frames = [
            GeneralFrame::new(PING_REQ, vec![]),
            GeneralFrame::new(PING_REQ.to_srsp(), vec![0x45, 0x01]),
            GeneralFrame::new(PING_REQ.to_srsp(), (0u8..250).collect()),
        ];
        let stream: Vec<u8> = frames
            .iter()
            .flat_map(GeneralFrame::encode_transport)
            .collect();

        let mut all_at_once = FrameDecoder::new();
        let bulk = all_at_once.feed(&stream);

        let mut byte_by_byte = FrameDecoder::new();
        let mut single: Vec<GeneralFrame> = Vec::new();
        for byte in &stream {
            single.extend(byte_by_byte.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(bulk, frames);
        assert_eq!(single, frames);
    }

    #[test]
    fn test_noise_between_frames_is_skipped() {
        let frame = GeneralFrame::new(PING_REQ.to_srsp(), vec![0x01, 0x00]);

        let mut stream = vec![0x00, 0x13, 0x37];
        stream.extend(frame.encode_transport());
        stream.extend([0xAB, 0xCD]);
        stream.extend(frame.encode_transport());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&stream), [frame.clone(), frame]);
    }

    #[test]
    fn test_corrupted_fcs_resyncs_to_next_frame() {
        let frame = GeneralFrame::new(PING_REQ.to_srsp(), vec![0x01, 0x00]);

        let mut corrupted = frame.encode_transport();
        *corrupted.last_mut().unwrap() ^= 0xFF;
        corrupted.extend(frame.encode_transport());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&corrupted), [frame]);
    }

    #[test]
    fn test_invalid_length_treated_as_noise() {
        let frame = GeneralFrame::new(PING_REQ, vec![]);

        // 0xFE followed by an impossible length byte
        let mut stream = vec![SOF, 0xFB, 0x00];
        stream.extend(frame.encode_transport());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&stream), [frame]);
    }

    #[test]
    fn test_sof_inside_garbage_does_not_stall() {
        let frame = GeneralFrame::new(PING_REQ, vec![]);

        // A lone SOF with a plausible length, then a real frame. The decoder
        // consumes the false start once its FCS fails.
        let mut stream = vec![SOF, 0x01];
        stream.extend(frame.encode_transport());
        stream.extend(frame.encode_transport());

        let mut decoder = FrameDecoder::new();
        let mut decoded = decoder.feed(&stream);
        decoded.extend(decoder.feed(&[0; 8]));
        assert!(decoded.contains(&frame));
    }
}
