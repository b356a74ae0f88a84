//! Partial BER decoding of IEC 61850-8-1 GOOSE frames.
//!
//! Only the fields needed for the stop trigger are extracted; unknown tags
//! are skipped by their declared length and the data payload is ignored.

use byteorder::{BigEndian, ByteOrder};

pub const ETHERTYPE_GOOSE: u16 = 0x88B8;

/// Smallest plausible frame: tagged Ethernet header (18) + APPID, Length
/// and Reserved words (8) + PDU tag and length (2).
const MIN_GOOSE_FRAME: usize = 28;

#[derive(Debug, Clone, Default)]
pub struct GooseMessage {
    pub app_id: u16,
    pub gocb_ref: String,
    pub time_allowed_to_live: u32,
    pub dat_set: String,
    pub st_num: u32,
    pub sq_num: u32,
    pub valid: bool,
}

/// GOOSE EtherType at byte 12, or at 16 behind an 802.1Q tag.
pub fn is_goose_frame(frame: &[u8]) -> bool {
    if frame.len() < 14 {
        return false;
    }
    let off = ethertype_offset(frame);
    frame.len() >= off + 2 && frame[off] == 0x88 && frame[off + 1] == 0xB8
}

fn ethertype_offset(frame: &[u8]) -> usize {
    if frame.len() >= 14 && frame[12] == 0x81 && frame[13] == 0x00 {
        16
    } else {
        12
    }
}

/// Short- or long-form BER length (at most two length bytes).
fn read_ber_len(frame: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *frame.get(*pos)?;
    *pos += 1;
    if first & 0x80 == 0 {
        return Some(usize::from(first));
    }
    match first & 0x7F {
        1 => {
            let b = *frame.get(*pos)?;
            *pos += 1;
            Some(usize::from(b))
        }
        2 => {
            if *pos + 2 > frame.len() {
                return None;
            }
            let len = usize::from(BigEndian::read_u16(&frame[*pos..]));
            *pos += 2;
            Some(len)
        }
        _ => None,
    }
}

/// Decode a received frame. `valid` is true iff a non-empty gocbRef was
/// extracted; every other field is best-effort.
pub fn decode(frame: &[u8]) -> GooseMessage {
    let mut msg = GooseMessage::default();

    if frame.len() < MIN_GOOSE_FRAME {
        return msg;
    }

    let mut pos = ethertype_offset(frame);
    if pos + 2 > frame.len() || frame[pos] != 0x88 || frame[pos + 1] != 0xB8 {
        return msg;
    }
    pos += 2;

    if pos + 8 > frame.len() {
        return msg;
    }
    msg.app_id = BigEndian::read_u16(&frame[pos..]);
    // Length word and the two reserved words are not needed.
    pos += 8;

    if frame.get(pos) != Some(&0x61) {
        return msg;
    }
    pos += 1;
    let pdu_len = match read_ber_len(frame, &mut pos) {
        Some(len) => len,
        None => return msg,
    };
    let pdu_end = (pos + pdu_len).min(frame.len());

    while pos < pdu_end {
        let tag = frame[pos];
        pos += 1;
        let len = match read_ber_len(frame, &mut pos) {
            Some(len) => len,
            None => break,
        };
        if pos + len > frame.len() {
            break;
        }
        let value = &frame[pos..pos + len];
        match tag {
            0x80 => msg.gocb_ref = String::from_utf8_lossy(value).into_owned(),
            0x81 if len == 4 => msg.time_allowed_to_live = BigEndian::read_u32(value),
            0x82 => msg.dat_set = String::from_utf8_lossy(value).into_owned(),
            0x85 if len == 4 => msg.st_num = BigEndian::read_u32(value),
            0x86 if len == 4 => msg.sq_num = BigEndian::read_u32(value),
            _ => {}
        }
        pos += len;
    }

    msg.valid = !msg.gocb_ref.is_empty();
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal GOOSE frame encoder used as a decode fixture.
    fn build_goose(gocb_ref: &str, st_num: u32, sq_num: u32, vlan: bool) -> Vec<u8> {
        let mut pdu = Vec::new();
        pdu.push(0x80);
        pdu.push(gocb_ref.len() as u8);
        pdu.extend_from_slice(gocb_ref.as_bytes());
        pdu.extend_from_slice(&[0x81, 4]);
        pdu.extend_from_slice(&10000u32.to_be_bytes());
        pdu.extend_from_slice(&[0x82, 3]);
        pdu.extend_from_slice(b"DS1");
        // An unrecognised tag the decoder must skip over.
        pdu.extend_from_slice(&[0x84, 2, 0xAA, 0xBB]);
        pdu.extend_from_slice(&[0x85, 4]);
        pdu.extend_from_slice(&st_num.to_be_bytes());
        pdu.extend_from_slice(&[0x86, 4]);
        pdu.extend_from_slice(&sq_num.to_be_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x01, 0x0C, 0xCD, 0x01, 0x00, 0x01]);
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        if vlan {
            frame.extend_from_slice(&[0x81, 0x00, 0x80, 0x04]);
        }
        frame.extend_from_slice(&[0x88, 0xB8]);
        frame.extend_from_slice(&0x3000u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 10) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.push(0x61);
        frame.push(pdu.len() as u8);
        frame.extend_from_slice(&pdu);
        frame
    }

    #[test]
    fn test_decode_roundtrip() {
        let frame = build_goose("IED1/LLN0$GO$STOP", 7, 3, false);
        let msg = decode(&frame);
        assert!(msg.valid);
        assert_eq!(msg.app_id, 0x3000);
        assert_eq!(msg.gocb_ref, "IED1/LLN0$GO$STOP");
        assert_eq!(msg.dat_set, "DS1");
        assert_eq!(msg.time_allowed_to_live, 10000);
        assert_eq!(msg.st_num, 7);
        assert_eq!(msg.sq_num, 3);
    }

    #[test]
    fn test_decode_vlan_tagged() {
        let frame = build_goose("IED1/LLN0$GO$STOP", 1, 2, true);
        assert!(is_goose_frame(&frame));
        let msg = decode(&frame);
        assert!(msg.valid);
        assert_eq!(msg.gocb_ref, "IED1/LLN0$GO$STOP");
        assert_eq!(msg.st_num, 1);
        assert_eq!(msg.sq_num, 2);
    }

    #[test]
    fn test_short_frame_invalid() {
        let frame = build_goose("X", 1, 1, false);
        assert!(!decode(&frame[..27]).valid);
        assert!(!decode(&[]).valid);
    }

    #[test]
    fn test_non_goose_ethertype_rejected() {
        let mut frame = build_goose("IED1/LLN0$GO$STOP", 1, 1, false);
        frame[12] = 0x88;
        frame[13] = 0xBA;
        assert!(!is_goose_frame(&frame));
        assert!(!decode(&frame).valid);
    }

    #[test]
    fn test_missing_gocb_ref_invalid() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x88, 0xB8]);
        frame.extend_from_slice(&[0x30, 0x00, 0x00, 0x0C, 0, 0, 0, 0]);
        frame.push(0x61);
        frame.push(6);
        // Only stNum present.
        frame.extend_from_slice(&[0x85, 4, 0, 0, 0, 9]);
        let msg = decode(&frame);
        assert!(!msg.valid);
        assert_eq!(msg.st_num, 9);
    }

    #[test]
    fn test_long_form_pdu_length() {
        let gocb = "A".repeat(150);
        let mut pdu = Vec::new();
        pdu.push(0x80);
        pdu.push(0x81);
        pdu.push(gocb.len() as u8);
        pdu.extend_from_slice(gocb.as_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&[0x88, 0xB8]);
        frame.extend_from_slice(&[0x30, 0x00, 0x00, 0x00, 0, 0, 0, 0]);
        frame.push(0x61);
        frame.push(0x81);
        frame.push(pdu.len() as u8);
        frame.extend_from_slice(&pdu);

        let msg = decode(&frame);
        assert!(msg.valid);
        assert_eq!(msg.gocb_ref, gocb);
    }

    #[test]
    fn test_truncated_field_stops_cleanly() {
        let mut frame = build_goose("IED1/LLN0$GO$STOP", 7, 3, false);
        // Declare a longer PDU and append a field whose length runs past
        // the end of the frame; the walk must stop without reading it.
        frame[23] = frame[23].wrapping_add(4);
        frame.push(0x87);
        frame.push(200);
        let msg = decode(&frame);
        assert!(msg.valid);
        assert_eq!(msg.gocb_ref, "IED1/LLN0$GO$STOP");
        assert_eq!(msg.sq_num, 3);
    }
}
