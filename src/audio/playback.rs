//! # Playback Pipeline
//!
//! Schedules decoded agent audio so chunks play back-to-back, and supports a
//! hard stop (flush) when the user interrupts the agent.
//!
//! ## Timing model:
//! The output side is a `PlaybackMixer` driven by whatever renders audio (the
//! speaker callback or the WAV recorder). Its clock is the number of frames
//! rendered so far, so "now" is `frames_rendered / sample_rate`. Scheduling
//! works in whole frames, which makes back-to-back placement exact: the start
//! frame of chunk *k+1* is the end frame of chunk *k*.
//!
//! ## Thread Safety:
//! The mixer state sits behind `Arc<Mutex<..>>` because the render callback
//! runs on the audio thread while scheduling happens on the session loop.

use crate::audio::analyser::AnalyserTap;
use crate::audio::codec::{decode_for_playback, PlayableBuffer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one in-flight playback unit.
///
/// Cloning shares the same underlying source; stopping any clone stops all.
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    id: u64,
    start_frame: u64,
    samples: Arc<[f32]>,
    sample_rate: u32,
    stopped: Arc<AtomicBool>,
}

impl ScheduledSource {
    fn new(buffer: PlayableBuffer, start_frame: u64) -> Self {
        Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            start_frame,
            samples: buffer.samples.into(),
            sample_rate: buffer.sample_rate,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    /// Scheduled start in seconds on the output clock.
    pub fn start_time(&self) -> f64 {
        self.start_frame as f64 / self.sample_rate as f64
    }

    /// Scheduled end in seconds on the output clock.
    pub fn end_time(&self) -> f64 {
        self.end_frame() as f64 / self.sample_rate as f64
    }

    /// Stop the source. Stopping twice, or after it finished, is a no-op.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self, now_frame: u64) -> bool {
        now_frame >= self.end_frame()
    }

    fn sample_at(&self, frame: u64) -> Option<f32> {
        if frame < self.start_frame {
            return None;
        }
        self.samples.get((frame - self.start_frame) as usize).copied()
    }
}

#[derive(Debug, Default)]
struct MixerState {
    frames_rendered: u64,
    sources: Vec<ScheduledSource>,
}

/// Output side of the playback graph: sums every live source into the
/// rendered buffer and advances the output clock.
#[derive(Debug, Clone)]
pub struct PlaybackMixer {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    analyser: AnalyserTap,
}

impl PlaybackMixer {
    pub fn new(sample_rate: u32, analyser: AnalyserTap) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState::default())),
            sample_rate,
            analyser,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far (the output clock).
    pub fn current_frame(&self) -> u64 {
        self.lock().frames_rendered
    }

    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate as f64
    }

    fn add_source(&self, source: ScheduledSource) {
        let mut state = self.lock();
        state.sources.retain(|s| !s.is_stopped());
        state.sources.push(source);
    }

    /// Forget stopped sources without waiting for the next render.
    pub fn prune_stopped(&self) {
        self.lock().sources.retain(|s| !s.is_stopped());
    }

    /// Sources the mixer still holds, finished or not.
    pub fn source_count(&self) -> usize {
        self.lock().sources.len()
    }

    /// True when no scheduled audio remains to be rendered.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        let now = state.frames_rendered;
        state
            .sources
            .iter()
            .all(|s| s.is_stopped() || s.is_finished(now))
    }

    /// Fill `out` with the next `out.len()` mono frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        let mut state = self.lock();
        let base = state.frames_rendered;

        for (offset, slot) in out.iter_mut().enumerate() {
            let frame = base + offset as u64;
            let mixed: f32 = state
                .sources
                .iter()
                .filter(|s| !s.is_stopped())
                .filter_map(|s| s.sample_at(frame))
                .sum();
            *slot = mixed.clamp(-1.0, 1.0);
        }

        state.frames_rendered = base + out.len() as u64;
        let now = state.frames_rendered;
        state.sources.retain(|s| !s.is_stopped() && !s.is_finished(now));
        drop(state);

        self.analyser.observe(out);
    }
}

/// Schedules decoded chunks contiguously and tracks them until completion or
/// flush.
#[derive(Debug)]
pub struct PlaybackPipeline {
    mixer: PlaybackMixer,
    next_start_frame: u64,
    active_sources: Vec<ScheduledSource>,
}

impl PlaybackPipeline {
    pub fn new(mixer: PlaybackMixer) -> Self {
        Self {
            mixer,
            next_start_frame: 0,
            active_sources: Vec::new(),
        }
    }

    pub fn mixer(&self) -> &PlaybackMixer {
        &self.mixer
    }

    /// Decode `bytes` and schedule them to start exactly where the previous
    /// chunk ends (or now, if playback has caught up).
    ///
    /// Returns the scheduled source, or `None` when the bytes held nothing
    /// playable.
    pub fn buffer_audio(&mut self, bytes: &[u8]) -> Option<ScheduledSource> {
        let buffer = decode_for_playback(bytes, self.mixer.sample_rate())?;
        let duration = buffer.duration_seconds();
        let now = self.mixer.current_frame();

        self.active_sources.retain(|s| !s.is_finished(now));

        let start_frame = self.next_start_frame.max(now);
        let source = ScheduledSource::new(buffer, start_frame);
        self.next_start_frame = source.end_frame();

        debug!(
            source_id = source.id(),
            start = source.start_time(),
            end = source.end_time(),
            duration,
            held = self.mixer.source_count(),
            "scheduled agent audio"
        );

        self.mixer.add_source(source.clone());
        self.active_sources.push(source.clone());
        Some(source)
    }

    /// Stop every tracked source immediately and forget them.
    ///
    /// The scheduling cursor is reset so audio arriving after an interruption
    /// starts right away instead of after the flushed backlog.
    pub fn clear_audio_buffer(&mut self) {
        let stopped = self.active_sources.len();
        for source in self.active_sources.drain(..) {
            source.stop();
        }
        self.mixer.prune_stopped();
        self.next_start_frame = 0;
        if stopped > 0 {
            debug!(stopped, "flushed agent audio");
        }
    }

    pub fn active_sources(&self) -> &[ScheduledSource] {
        &self.active_sources
    }

    /// Seconds (on the output clock) when the last scheduled chunk ends.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_frame as f64 / self.mixer.sample_rate() as f64
    }

    /// Scheduled agent audio not yet rendered, in seconds.
    pub fn queued_seconds(&self) -> f64 {
        if self.mixer.is_drained() {
            return 0.0;
        }
        (self.next_start_time() - self.mixer.current_time()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: usize, value: i16) -> Vec<u8> {
        (0..samples).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn pipeline() -> PlaybackPipeline {
        PlaybackPipeline::new(PlaybackMixer::new(24000, AnalyserTap::new(0.5)))
    }

    #[test]
    fn test_chunks_are_contiguous() {
        let mut playback = pipeline();
        let sizes = [480, 1024, 7, 2400, 333];
        let sources: Vec<_> = sizes
            .iter()
            .map(|&n| playback.buffer_audio(&pcm(n, 1000)).unwrap())
            .collect();

        assert_eq!(sources[0].start_time(), 0.0);
        for pair in sources.windows(2) {
            assert_eq!(pair[1].start_time(), pair[0].end_time());
            assert_eq!(pair[1].start_frame(), pair[0].end_frame());
        }
        assert_eq!(playback.active_sources().len(), sizes.len());
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let mut playback = pipeline();
        playback.buffer_audio(&pcm(100, 1000)).unwrap();

        let mut out = vec![0.0; 500];
        playback.mixer().render(&mut out);

        let late = playback.buffer_audio(&pcm(100, 1000)).unwrap();
        assert_eq!(late.start_frame(), 500);
        assert_eq!(playback.active_sources().len(), 1);
    }

    #[test]
    fn test_flush_stops_everything() {
        let mut playback = pipeline();
        let first = playback.buffer_audio(&pcm(1000, 8000)).unwrap();
        let second = playback.buffer_audio(&pcm(1000, 8000)).unwrap();

        playback.clear_audio_buffer();
        assert!(playback.active_sources().is_empty());
        assert!(first.is_stopped() && second.is_stopped());

        let mut out = vec![1.0; 2000];
        playback.mixer().render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(playback.mixer().is_drained());

        // flushing again, or stopping a finished source, is harmless
        playback.clear_audio_buffer();
        first.stop();
    }

    #[test]
    fn test_mixer_renders_scheduled_samples_in_order() {
        let mut playback = pipeline();
        playback.buffer_audio(&pcm(2, 16384)).unwrap();
        playback.buffer_audio(&pcm(2, -16384)).unwrap();

        let mut out = vec![0.0; 6];
        playback.mixer().render(&mut out);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert!(playback.mixer().is_drained());
        assert!(playback.mixer().current_time() > 0.0);
    }

    #[test]
    fn test_flush_releases_sources_without_rendering() {
        let mut playback = pipeline();
        for round in 0..10 {
            for _ in 0..20 {
                playback.buffer_audio(&pcm(240, 1000)).unwrap();
            }
            if round % 2 == 1 {
                playback.clear_audio_buffer();
                assert_eq!(playback.mixer().source_count(), 0);
            }
        }
        assert!(playback.active_sources().is_empty());
        assert_eq!(playback.mixer().current_frame(), 0);
    }

    #[test]
    fn test_queued_seconds_tracks_backlog() {
        let mut playback = pipeline();
        assert_eq!(playback.queued_seconds(), 0.0);

        playback.buffer_audio(&pcm(2400, 1000)).unwrap();
        playback.buffer_audio(&pcm(2400, 1000)).unwrap();
        assert!((playback.queued_seconds() - 0.2).abs() < 1e-9);

        let mut out = vec![0.0; 1200];
        playback.mixer().render(&mut out);
        assert!((playback.queued_seconds() - 0.15).abs() < 1e-9);

        playback.clear_audio_buffer();
        assert_eq!(playback.queued_seconds(), 0.0);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut playback = pipeline();
        assert!(playback.buffer_audio(&[]).is_none());
        assert_eq!(playback.next_start_time(), 0.0);
    }
}
