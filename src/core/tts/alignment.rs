//! Timing-alignment metadata for synthesized speech.
//!
//! The synthesis provider streams per-character timing alongside audio.
//! The accumulated trace maps elapsed playback time to a text offset,
//! which is what makes exact barge-in reconstruction possible.

/// One aligned unit: a character with its playback window.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentUnit {
    pub unit: String,
    pub start_ms: u64,
    pub duration_ms: u64,
}

/// Ordered alignment units for one in-flight response.
#[derive(Debug, Clone, Default)]
pub struct AlignmentTrace {
    units: Vec<AlignmentUnit>,
}

impl AlignmentTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Append one provider alignment chunk. The three arrays are parallel;
    /// ragged chunks are truncated to the shortest length.
    pub fn extend_from_wire(&mut self, chars: &[String], starts_ms: &[u64], durations_ms: &[u64]) {
        let n = chars.len().min(starts_ms.len()).min(durations_ms.len());
        self.units.reserve(n);
        for i in 0..n {
            self.units.push(AlignmentUnit {
                unit: chars[i].clone(),
                start_ms: starts_ms[i],
                duration_ms: durations_ms[i],
            });
        }
    }

    /// Number of characters whose playback had started by `elapsed_ms`.
    pub fn chars_spoken_by(&self, elapsed_ms: u64) -> usize {
        self.units
            .iter()
            .take_while(|u| u.start_ms < elapsed_ms)
            .count()
    }

    /// Playback length of the fully synthesized response.
    pub fn total_duration_ms(&self) -> u64 {
        self.units
            .last()
            .map(|u| u.start_ms + u.duration_ms)
            .unwrap_or(0)
    }
}
