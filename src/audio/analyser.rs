//! Voice-activity analysers for the capture and playback graphs.
//!
//! Purely observational: levels are published for visualization and never
//! feed back into control flow.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Smoothed RMS level meter, shareable between the audio thread and readers.
#[derive(Debug, Clone)]
pub struct AnalyserTap {
    level_bits: Arc<AtomicU32>,
    smoothing: f32,
}

impl AnalyserTap {
    pub fn new(smoothing: f32) -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(0f32.to_bits())),
            smoothing: smoothing.clamp(0.0, 0.999),
        }
    }

    /// Feed one block of samples.
    pub fn observe(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        let previous = self.level();
        let next = self.smoothing * previous + (1.0 - self.smoothing) * rms;
        self.level_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Current smoothed level (0.0 = silence).
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.level_bits.store(0f32.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_stays_at_zero() {
        let tap = AnalyserTap::new(0.5);
        tap.observe(&[0.0; 256]);
        assert_eq!(tap.level(), 0.0);
    }

    #[test]
    fn test_level_rises_with_signal_and_is_shared() {
        let tap = AnalyserTap::new(0.5);
        let reader = tap.clone();
        tap.observe(&[0.5; 256]);
        assert!((reader.level() - 0.25).abs() < 1e-6);
        tap.observe(&[0.5; 256]);
        assert!(reader.level() > 0.25);
        tap.reset();
        assert_eq!(reader.level(), 0.0);
    }
}
