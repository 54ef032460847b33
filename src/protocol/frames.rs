/// Media-channel frame parser. Inbound frames are:
///
///   [36-byte media header][44-byte sub-header][payload, header field3 bytes]
///
/// The sub-header carries a timestamp, codec tag and frame counter; only
/// the codec tag (3 = H.264) is consulted. Payloads open with one or more
/// vendor NAL units (start code followed by 0xC6/0xC7, typically 22 bytes)
/// before standard H.264 NAL units begin.
use bytes::{Buf, Bytes, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use crate::protocol::HEADER_SIZE;

pub const SUB_HEADER_SIZE: usize = 44;
const FRAME_FIXED: usize = HEADER_SIZE + SUB_HEADER_SIZE;
/// Codec tag offset inside the sub-header.
const CODEC_OFFSET: usize = HEADER_SIZE + 32;
const CODEC_H264: u32 = 3;
/// Frames larger than this mean we are reading mid-stream garbage.
const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

const MAGIC_BYTES: [u8; 4] = [0x05, 0x01, 0x11, 0x50];
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Incremental frame reassembly over raw media-channel reads. Feed chunks
/// with [`extend`](Self::extend), drain clean H.264 slices with
/// [`next_frame`](Self::next_frame).
#[derive(Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    /// Wire desynchronizations recovered by magic scan.
    pub resyncs: u64,
    /// Frames discarded (no usable start code, or non-video codec).
    pub dropped: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete H.264 slice, or None when more data is needed.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if self.buf.len() < FRAME_FIXED {
                return None;
            }

            if self.buf[..4] != MAGIC_BYTES {
                self.resync();
                continue;
            }

            let payload_len = BigEndian::read_u32(&self.buf[12..16]) as usize;
            if payload_len > MAX_PAYLOAD {
                warn!(payload_len, "implausible media payload length, resyncing");
                self.resync();
                continue;
            }

            let total = FRAME_FIXED + payload_len;
            if self.buf.len() < total {
                return None;
            }

            let codec = BigEndian::read_u32(&self.buf[CODEC_OFFSET..CODEC_OFFSET + 4]);
            let frame = self.buf.split_to(total).freeze();

            if codec != CODEC_H264 {
                debug!(codec, "skipping non-H.264 media frame");
                self.dropped += 1;
                continue;
            }

            let payload = frame.slice(FRAME_FIXED..);
            match h264_start(&payload) {
                Some(idx) => return Some(payload.slice(idx..)),
                None => {
                    self.dropped += 1;
                    continue;
                }
            }
        }
    }

    /// Discard bytes until the next media magic. Keeps the last 3 bytes
    /// in case the magic straddles a read boundary.
    fn resync(&mut self) {
        self.resyncs += 1;
        let skip = self.buf[1..]
            .windows(4)
            .position(|w| w == MAGIC_BYTES)
            .map(|p| p + 1)
            .unwrap_or_else(|| self.buf.len().saturating_sub(3));
        warn!(skipped = skip, "media channel desynchronized, scanning for magic");
        self.buf.advance(skip);
    }
}

/// Offset of the first 4-byte start code whose following byte is not a
/// vendor NAL type (0xC6/0xC7). None means the frame has nothing usable.
fn h264_start(payload: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos + 5 <= payload.len() {
        match payload[pos..payload.len() - 1]
            .windows(4)
            .position(|w| w == START_CODE)
        {
            Some(rel) => {
                let idx = pos + rel;
                let nal = payload[idx + 4];
                if nal != 0xc6 && nal != 0xc7 {
                    return Some(idx);
                }
                pos = idx + 4;
            }
            None => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MEDIA_MAGIC, VERSION};

    /// 22-byte vendor NAL prefix followed by an SPS-looking NAL.
    fn vendor_payload() -> Vec<u8> {
        let mut p = vec![0, 0, 0, 1, 0xc7];
        p.extend_from_slice(&[0x11; 17]);
        assert_eq!(p.len(), 22);
        p.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0xab]);
        p
    }

    fn build_frame(codec: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        for field in [
            MEDIA_MAGIC,
            VERSION,
            0,
            payload.len() as u32,
            0,
            0,
            0,
            0,
            0,
        ] {
            frame.extend_from_slice(&field.to_be_bytes());
        }
        let mut sub = [0u8; SUB_HEADER_SIZE];
        sub[32..36].copy_from_slice(&codec.to_be_bytes());
        frame.extend_from_slice(&sub);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn vendor_prefix_is_skipped() {
        let payload = vendor_payload();
        let mut asm = FrameAssembler::new();
        asm.extend(&build_frame(CODEC_H264, &payload));
        let out = asm.next_frame().unwrap();
        // Output begins at byte 22: the first non-vendor start code.
        assert_eq!(&out[..], &payload[22..]);
        assert_eq!(out[4], 0x67);
        assert!(asm.next_frame().is_none());
    }

    #[test]
    fn frame_without_start_code_is_dropped() {
        let mut asm = FrameAssembler::new();
        asm.extend(&build_frame(CODEC_H264, &[0xaa; 40]));
        assert!(asm.next_frame().is_none());
        assert_eq!(asm.dropped, 1);
    }

    #[test]
    fn all_vendor_payload_is_dropped() {
        let mut p = vec![0, 0, 0, 1, 0xc6];
        p.extend_from_slice(&[0x22; 17]);
        let mut asm = FrameAssembler::new();
        asm.extend(&build_frame(CODEC_H264, &p));
        assert!(asm.next_frame().is_none());
        assert_eq!(asm.dropped, 1);
    }

    #[test]
    fn non_video_frames_are_skipped() {
        let payload = vendor_payload();
        let mut asm = FrameAssembler::new();
        asm.extend(&build_frame(1, &payload));
        asm.extend(&build_frame(CODEC_H264, &payload));
        let out = asm.next_frame().unwrap();
        assert_eq!(&out[..], &payload[22..]);
        assert_eq!(asm.dropped, 1);
    }

    #[test]
    fn split_reads_reassemble() {
        let payload = vendor_payload();
        let frame = build_frame(CODEC_H264, &payload);
        let mut asm = FrameAssembler::new();
        asm.extend(&frame[..50]);
        assert!(asm.next_frame().is_none());
        asm.extend(&frame[50..]);
        assert!(asm.next_frame().is_some());
    }

    #[test]
    fn resync_after_garbage() {
        let payload = vendor_payload();
        let frame = build_frame(CODEC_H264, &payload);

        // 256 bytes of junk that cannot contain the magic (no 0x05).
        let garbage: Vec<u8> = (0..256u32).map(|i| 0x10 + (i % 0xe0) as u8).collect();

        let mut asm = FrameAssembler::new();
        asm.extend(&garbage);
        asm.extend(&frame);
        asm.extend(&frame);

        // Recovery within two subsequent frames.
        assert!(asm.next_frame().is_some());
        assert!(asm.next_frame().is_some());
        assert!(asm.resyncs >= 1);
    }
}
