//! IEC 61850-9-2 LE Sampled Value PDU encoding.
//!
//! The PDU starts with the SV EtherType and ends with the BER-encoded
//! SAVPDU (tag 0x60). Exactly one ASDU is ever emitted (noASDU = 1) and
//! the dataset carries eight channels of `INT32 value | quality` pairs.

use crate::config::Phasor;

pub const ETHERTYPE_SV: u16 = 0x88BA;
pub const SV_CHANNELS: usize = 8;

/// Nominal line frequency used for sinusoid synthesis.
pub const F_LINE: f64 = 60.0;

const NO_ASDU: u8 = 1;
const DATASET_LEN: usize = SV_CHANNELS * 8;

/// Number of bytes a BER length field occupies for `len` (minimal form).
pub(crate) fn len_field_size(len: usize) -> usize {
    if len < 128 {
        1
    } else if len < 256 {
        2
    } else {
        3
    }
}

/// Write `tag` and a minimal-form BER length.
pub(crate) fn push_tag_len(out: &mut Vec<u8>, tag: u8, len: usize) {
    debug_assert!(len <= 65535);
    out.push(tag);
    if len < 128 {
        out.push(len as u8);
    } else if len < 256 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push((len & 0xFF) as u8);
    }
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    push_tag_len(out, tag, value.len());
    out.extend_from_slice(value);
}

/// Round to nearest and saturate into the INT32 range.
pub(crate) fn saturating_sample(v: f64) -> i32 {
    v.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

/// Instantaneous channel values for one sample tick:
/// `mag * sqrt(2) * cos(2*pi*F_LINE*t + phase)` with `t = smp_cnt / smp_rate`.
pub fn synthesize(phasors: &[Phasor; SV_CHANNELS], smp_cnt: u16, smp_rate: u16) -> [i32; SV_CHANNELS] {
    let t = f64::from(smp_cnt) / f64::from(smp_rate);
    let omega = 2.0 * std::f64::consts::PI * F_LINE;
    let mut out = [0i32; SV_CHANNELS];
    for (sample, ph) in out.iter_mut().zip(phasors.iter()) {
        let v = ph.magnitude * std::f64::consts::SQRT_2 * (omega * t + ph.angle_deg.to_radians()).cos();
        *sample = saturating_sample(v);
    }
    out
}

/// Builds successive SV PDUs for one stream.
///
/// `smp_cnt` is read by `encode_into` and advanced by `advance`; it wraps
/// back to zero when it reaches the sample rate.
pub struct SvPduBuilder {
    app_id: u16,
    sv_id: String,
    smp_cnt: u16,
    conf_rev: u32,
    smp_synch: u8,
    smp_rate: u16,
}

impl SvPduBuilder {
    pub fn new(app_id: u16, sv_id: &str, smp_rate: u16) -> SvPduBuilder {
        SvPduBuilder {
            app_id,
            sv_id: sv_id.to_string(),
            smp_cnt: 0,
            conf_rev: 1,
            smp_synch: 1,
            smp_rate,
        }
    }

    pub fn smp_cnt(&self) -> u16 {
        self.smp_cnt
    }

    /// Advance the sample counter, wrapping modulo the sample rate.
    pub fn advance(&mut self) {
        self.smp_cnt += 1;
        if self.smp_cnt >= self.smp_rate {
            self.smp_cnt = 0;
        }
    }

    /// Append the PDU (EtherType through SAVPDU) for the current `smp_cnt`.
    ///
    /// `qualities` overrides the per-channel quality words; `None` emits
    /// all-zero quality.
    pub fn encode_into(
        &self,
        out: &mut Vec<u8>,
        samples: &[i32; SV_CHANNELS],
        qualities: Option<&[u32; SV_CHANNELS]>,
    ) {
        let mut asdu = Vec::with_capacity(DATASET_LEN + 48);
        push_tlv(&mut asdu, 0x80, self.sv_id.as_bytes());
        push_tlv(&mut asdu, 0x82, &self.smp_cnt.to_be_bytes());
        push_tlv(&mut asdu, 0x83, &self.conf_rev.to_be_bytes());
        push_tlv(&mut asdu, 0x85, &[self.smp_synch]);
        push_tlv(&mut asdu, 0x86, &self.smp_rate.to_be_bytes());
        push_tag_len(&mut asdu, 0x87, DATASET_LEN);
        for ch in 0..SV_CHANNELS {
            asdu.extend_from_slice(&samples[ch].to_be_bytes());
            let quality = qualities.map_or(0, |q| q[ch]);
            asdu.extend_from_slice(&quality.to_be_bytes());
        }

        let mut savpdu = Vec::with_capacity(asdu.len() + 12);
        push_tlv(&mut savpdu, 0x80, &[NO_ASDU]);
        let asdu_tlv_len = 1 + len_field_size(asdu.len()) + asdu.len();
        push_tag_len(&mut savpdu, 0xA2, asdu_tlv_len);
        push_tag_len(&mut savpdu, 0x30, asdu.len());
        savpdu.extend_from_slice(&asdu);

        // LEN counts from the EtherType through the last SAVPDU byte.
        let savpdu_tlv_len = 1 + len_field_size(savpdu.len()) + savpdu.len();
        let total_len = (10 + savpdu_tlv_len) as u16;

        out.extend_from_slice(&ETHERTYPE_SV.to_be_bytes());
        out.extend_from_slice(&self.app_id.to_be_bytes());
        out.extend_from_slice(&total_len.to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);
        push_tag_len(out, 0x60, savpdu.len());
        out.extend_from_slice(&savpdu);
    }
}

// ============================================================================
// TESTS
// ============================================================================
