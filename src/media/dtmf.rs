//! DTMF tone synthesis, ITU-T Q.23 frequency pairs, rendered straight to
//! 8kHz µ-law for injection into the carrier media stream.

use super::codecs::{linear_to_ulaw, ULAW_SILENCE};
use std::f32::consts::PI;

const SAMPLE_RATE: u32 = 8000;

/// Per-sinusoid amplitude; two summed tones stay well below i16 saturation.
const TONE_AMPLITUDE: f32 = 0.65 * 16384.0;

/// 'w' in a dial string pauses for half a second.
const PAUSE_MS: u32 = 500;

pub const DEFAULT_TONE_MS: u32 = 100;
pub const DEFAULT_GAP_MS: u32 = 80;

// Row/column frequencies per ITU-T Q.23
fn tone_pair(digit: char) -> Option<(f32, f32)> {
    match digit {
        '1' => Some((697.0, 1209.0)),
        '2' => Some((697.0, 1336.0)),
        '3' => Some((697.0, 1477.0)),
        '4' => Some((770.0, 1209.0)),
        '5' => Some((770.0, 1336.0)),
        '6' => Some((770.0, 1477.0)),
        '7' => Some((852.0, 1209.0)),
        '8' => Some((852.0, 1336.0)),
        '9' => Some((852.0, 1477.0)),
        '0' => Some((941.0, 1336.0)),
        '*' => Some((941.0, 1209.0)),
        '#' => Some((941.0, 1477.0)),
        'A' => Some((697.0, 1633.0)),
        'B' => Some((770.0, 1633.0)),
        'C' => Some((852.0, 1633.0)),
        'D' => Some((941.0, 1633.0)),
        _ => None,
    }
}

fn samples_for_ms(ms: u32) -> usize {
    (SAMPLE_RATE as u64 * ms as u64 / 1000) as usize
}

fn push_tone(out: &mut Vec<u8>, freq_low: f32, freq_high: f32, tone_ms: u32) {
    let samples = samples_for_ms(tone_ms);
    for i in 0..samples {
        let t = i as f32 / SAMPLE_RATE as f32;
        let sample = TONE_AMPLITUDE * (2.0 * PI * freq_low * t).sin()
            + TONE_AMPLITUDE * (2.0 * PI * freq_high * t).sin();
        out.push(linear_to_ulaw(sample as i16));
    }
}

fn push_silence(out: &mut Vec<u8>, ms: u32) {
    out.extend(std::iter::repeat(ULAW_SILENCE).take(samples_for_ms(ms)));
}

/// Synthesize a dial string as µ-law audio. `0-9`, `*`, `#` and `A-D`
/// (case-insensitive) become tones, `w`/`W` a 500ms pause; anything else
/// is skipped. Tones are separated by `gap_ms` of silence with no gap
/// after the last one.
pub fn generate_dtmf(digits: &str, tone_ms: u32, gap_ms: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut first = true;
    for ch in digits.chars() {
        let ch = ch.to_ascii_uppercase();
        let is_pause = ch == 'W';
        if !is_pause && tone_pair(ch).is_none() {
            continue;
        }
        if !first {
            push_silence(&mut out, gap_ms);
        }
        first = false;
        if is_pause {
            push_silence(&mut out, PAUSE_MS);
        } else if let Some((low, high)) = tone_pair(ch) {
            push_tone(&mut out, low, high, tone_ms);
        }
    }
    out
}
