//! G.711 mu-law companding.
//!
//! The telephony bridge carries 8kHz mono mu-law. The synthesis provider
//! is normally configured to emit mu-law directly (passthrough), but when
//! it is set to linear PCM these routines compand on the way out, and the
//! usage meter relies on the decoded sample count either way.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compand one 16-bit linear sample to mu-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent: u32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0f) as u8;

    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Expand one mu-law byte to a 16-bit linear sample.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0f) as i32;

    let mut magnitude = ((mantissa << 3) + BIAS) << exponent;
    magnitude -= BIAS;

    if sign != 0 {
        -(magnitude as i16)
    } else {
        magnitude as i16
    }
}

/// Compand a little-endian 16-bit PCM buffer to mu-law.
///
/// A trailing odd byte is dropped; frames on the wire are always
/// sample-aligned.
pub fn encode_pcm16le(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| linear_to_ulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Expand a mu-law buffer to little-endian 16-bit PCM.
pub fn decode_to_pcm16le(ulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw.len() * 2);
    for &byte in ulaw {
        out.extend_from_slice(&ulaw_to_linear(byte).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_companding() {
        // mu-law silence is 0xFF
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn test_sign_is_preserved() {
        let positive = ulaw_to_linear(linear_to_ulaw(8000));
        let negative = ulaw_to_linear(linear_to_ulaw(-8000));
        assert!(positive > 0);
        assert!(negative < 0);
        assert_eq!(positive, -negative);
    }

    #[test]
    fn test_companding_error_is_bounded() {
        // Quantization error grows with amplitude but stays within the
        // segment width at every level.
        for &sample in &[-30000i16, -1000, -33, 0, 33, 500, 1000, 30000] {
            let round = ulaw_to_linear(linear_to_ulaw(sample));
            let error = (round as i32 - sample as i32).abs();
            let bound = (sample as i32).abs() / 16 + 64;
            assert!(
                error <= bound,
                "sample {sample} round-tripped to {round} (error {error})"
            );
        }
    }

    #[test]
    fn test_extremes_do_not_overflow() {
        let _ = ulaw_to_linear(linear_to_ulaw(i16::MAX));
        let _ = ulaw_to_linear(linear_to_ulaw(i16::MIN));
        assert!(ulaw_to_linear(linear_to_ulaw(i16::MAX)) > 31000);
    }

    #[test]
    fn test_buffer_conversion() {
        let pcm: Vec<u8> = [0i16, 1000, -1000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let ulaw = encode_pcm16le(&pcm);
        assert_eq!(ulaw.len(), 3);
        let back = decode_to_pcm16le(&ulaw);
        assert_eq!(back.len(), 6);
    }

    #[test]
    fn test_odd_trailing_byte_dropped() {
        let ulaw = encode_pcm16le(&[0u8, 0, 0x12]);
        assert_eq!(ulaw.len(), 1);
    }
}
