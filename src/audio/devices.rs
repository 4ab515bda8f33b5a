//! Concrete microphone and speaker adapters.
//!
//! - `WavMicrophone`: plays a WAV file into the capture pipeline in real time,
//!   then keeps sending silence so the agent's end-of-speech detection fires.
//! - `PacedSpeaker`: renders the playback mixer at real-time pace, optionally
//!   recording the result to a WAV file.
//! - `cpal` adapters (feature `device-audio`): the system microphone and speaker.

use crate::audio::capture::{
    unavailable, BlockAccumulator, CapturedBlock, MicrophoneSource, MicrophoneStream,
};
use crate::audio::codec::to_mono;
use crate::audio::playback::PlaybackMixer;
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Render period of the paced speaker.
const RENDER_PERIOD: Duration = Duration::from_millis(20);

/// Output side of the playback graph.
pub trait SpeakerOutput: Send {
    /// Begin pulling audio from `mixer`.
    fn start(&mut self, mixer: PlaybackMixer) -> AppResult<()>;

    /// Stop pulling audio and release the device. Must be idempotent.
    fn stop(&mut self);
}

/// Park until `deadline`, or until `running` is cleared. Stop paths unpark
/// the worker before joining it.
fn pace_until(deadline: Instant, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        match deadline.checked_duration_since(Instant::now()) {
            Some(wait) if !wait.is_zero() => std::thread::park_timeout(wait),
            _ => return,
        }
    }
}

/// Pick the microphone for this configuration.
pub fn microphone_from_config(config: &AudioConfig) -> Box<dyn MicrophoneSource> {
    if let Some(path) = &config.input_file {
        return Box::new(WavMicrophone::new(path));
    }
    #[cfg(feature = "device-audio")]
    {
        Box::new(cpal_device::CpalMicrophone::default())
    }
    #[cfg(not(feature = "device-audio"))]
    {
        Box::new(NoMicrophone)
    }
}

/// Pick the speaker for this configuration.
pub fn speaker_from_config(config: &AudioConfig) -> Box<dyn SpeakerOutput> {
    if let Some(path) = &config.output_file {
        return Box::new(PacedSpeaker::recording_to(path));
    }
    #[cfg(feature = "device-audio")]
    {
        Box::new(cpal_device::CpalSpeaker::default())
    }
    #[cfg(not(feature = "device-audio"))]
    {
        Box::new(PacedSpeaker::discarding())
    }
}

/// Used when no input file is configured and device audio is compiled out.
#[cfg(not(feature = "device-audio"))]
struct NoMicrophone;

#[cfg(not(feature = "device-audio"))]
impl MicrophoneSource for NoMicrophone {
    fn acquire(
        &self,
        _block_size: usize,
        _blocks: mpsc::UnboundedSender<CapturedBlock>,
    ) -> AppResult<Box<dyn MicrophoneStream>> {
        Err(unavailable(
            "no input file configured and device audio is not compiled in",
        ))
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// A WAV file standing in for the microphone.
pub struct WavMicrophone {
    path: PathBuf,
}

impl WavMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MicrophoneSource for WavMicrophone {
    fn acquire(
        &self,
        block_size: usize,
        blocks: mpsc::UnboundedSender<CapturedBlock>,
    ) -> AppResult<Box<dyn MicrophoneStream>> {
        let (samples, sample_rate) = read_wav_mono(&self.path)?;
        info!(
            path = %self.path.display(),
            samples = samples.len(),
            sample_rate,
            "loaded WAV microphone input"
        );
        Ok(Box::new(WavStream {
            samples: Arc::new(samples),
            sample_rate,
            block_size,
            blocks,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }

    fn describe(&self) -> String {
        format!("wav:{}", self.path.display())
    }
}

/// Read a WAV file as mono f32 samples.
pub fn read_wav_mono(path: &std::path::Path) -> AppResult<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| unavailable(&format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok((to_mono(&interleaved, spec.channels), spec.sample_rate))
}

struct WavStream {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    block_size: usize,
    blocks: mpsc::UnboundedSender<CapturedBlock>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MicrophoneStream for WavStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn connect(&mut self) -> AppResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let samples = self.samples.clone();
        let sample_rate = self.sample_rate;
        let block_size = self.block_size;
        let blocks = self.blocks.clone();
        let running = self.running.clone();
        let block_period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);

        let worker = std::thread::Builder::new()
            .name("wav-microphone".to_string())
            .spawn(move || {
                let mut accumulator = BlockAccumulator::new(block_size);
                let mut ready = accumulator.push(&samples);
                let tail = accumulator.pending_len();
                if tail > 0 {
                    ready.extend(accumulator.push(&vec![0.0; block_size - tail]));
                }
                let mut file_blocks = ready.into_iter();
                let mut deadline = Instant::now();

                while running.load(Ordering::SeqCst) {
                    let samples = file_blocks.next().unwrap_or_else(|| vec![0.0; block_size]);
                    if blocks.send(CapturedBlock { samples, sample_rate }).is_err() {
                        break;
                    }
                    deadline += block_period;
                    pace_until(deadline, &running);
                }
                debug!("WAV microphone worker exited");
            })
            .map_err(|e| AppError::Device(format!("cannot spawn microphone worker: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                warn!("WAV microphone worker panicked");
            }
        }
    }
}

impl Drop for WavStream {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Renders the mixer every 20ms, like a sound card would pull it.
pub struct PacedSpeaker {
    path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PacedSpeaker {
    pub fn recording_to(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn discarding() -> Self {
        Self {
            path: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl SpeakerOutput for PacedSpeaker {
    fn start(&mut self, mixer: PlaybackMixer) -> AppResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mut writer = match &self.path {
            Some(path) => {
                let spec = hound::WavSpec {
                    channels: 1,
                    sample_rate: mixer.sample_rate(),
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };
                Some(hound::WavWriter::create(path, spec)?)
            }
            None => None,
        };

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let frames = (mixer.sample_rate() as u128 * RENDER_PERIOD.as_millis() / 1000) as usize;

        let worker = std::thread::Builder::new()
            .name("paced-speaker".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; frames.max(1)];
                let mut deadline = Instant::now();
                while running.load(Ordering::SeqCst) {
                    mixer.render(&mut buffer);
                    if let Some(w) = writer.as_mut() {
                        for &sample in &buffer {
                            let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                            if let Err(e) = w.write_sample(value) {
                                error!(error = %e, "failed to record agent audio");
                                running.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    deadline += RENDER_PERIOD;
                    pace_until(deadline, &running);
                }
                if let Some(w) = writer {
                    if let Err(e) = w.finalize() {
                        error!(error = %e, "failed to finalize agent audio recording");
                    }
                }
            })
            .map_err(|e| AppError::Device(format!("cannot spawn speaker worker: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                warn!("speaker worker panicked");
            }
        }
    }
}

impl Drop for PacedSpeaker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "device-audio")]
mod cpal_device {
    //! System audio through cpal.
    //!
    //! cpal streams are not `Send`, so each stream lives on its own thread and
    //! is driven through a command channel.

    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::mpsc as std_mpsc;

    enum StreamCommand {
        Play,
        Shutdown,
    }

    #[derive(Default)]
    pub struct CpalMicrophone;

    impl MicrophoneSource for CpalMicrophone {
        fn acquire(
            &self,
            block_size: usize,
            blocks: mpsc::UnboundedSender<CapturedBlock>,
        ) -> AppResult<Box<dyn MicrophoneStream>> {
            let (ready_tx, ready_rx) = std_mpsc::channel::<AppResult<u32>>();
            let (command_tx, command_rx) = std_mpsc::channel::<StreamCommand>();

            let worker = std::thread::Builder::new()
                .name("cpal-microphone".to_string())
                .spawn(move || {
                    let built = build_input(block_size, blocks);
                    let stream = match built {
                        Ok((stream, rate)) => {
                            let _ = ready_tx.send(Ok(rate));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    while let Ok(command) = command_rx.recv() {
                        match command {
                            StreamCommand::Play => {
                                if let Err(e) = stream.play() {
                                    error!("failed to start input stream: {e}");
                                }
                            }
                            StreamCommand::Shutdown => break,
                        }
                    }
                    drop(stream);
                })
                .map_err(|e| AppError::Device(format!("cannot spawn microphone thread: {}", e)))?;

            let sample_rate = ready_rx
                .recv()
                .map_err(|_| unavailable("microphone thread exited"))??;

            Ok(Box::new(CpalInputStream {
                sample_rate,
                commands: command_tx,
                worker: Some(worker),
            }))
        }

        fn describe(&self) -> String {
            "cpal:default".to_string()
        }
    }

    fn build_input(
        block_size: usize,
        blocks: mpsc::UnboundedSender<CapturedBlock>,
    ) -> AppResult<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| unavailable("no default input device"))?;
        let default_config = device
            .default_input_config()
            .map_err(|e| unavailable(&format!("no default input config: {e}")))?;

        let sample_rate = default_config.sample_rate();
        let channels = default_config.channels();
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let mut accumulator = BlockAccumulator::new(block_size);
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, channels);
                    for samples in accumulator.push(&mono) {
                        let _ = blocks.send(CapturedBlock {
                            samples,
                            sample_rate,
                        });
                    }
                },
                move |err| error!("audio input stream error: {err}"),
                None,
            )
            .map_err(|e| unavailable(&format!("failed to build input stream: {e}")))?;

        Ok((stream, sample_rate))
    }

    struct CpalInputStream {
        sample_rate: u32,
        commands: std_mpsc::Sender<StreamCommand>,
        worker: Option<JoinHandle<()>>,
    }

    impl MicrophoneStream for CpalInputStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn connect(&mut self) -> AppResult<()> {
            self.commands
                .send(StreamCommand::Play)
                .map_err(|_| AppError::Device("microphone thread is gone".to_string()))
        }

        fn disconnect(&mut self) {
            let _ = self.commands.send(StreamCommand::Shutdown);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    #[derive(Default)]
    pub struct CpalSpeaker {
        commands: Option<std_mpsc::Sender<StreamCommand>>,
        worker: Option<JoinHandle<()>>,
    }

    impl SpeakerOutput for CpalSpeaker {
        fn start(&mut self, mixer: PlaybackMixer) -> AppResult<()> {
            if self.worker.is_some() {
                return Ok(());
            }
            let (ready_tx, ready_rx) = std_mpsc::channel::<AppResult<()>>();
            let (command_tx, command_rx) = std_mpsc::channel::<StreamCommand>();

            let worker = std::thread::Builder::new()
                .name("cpal-speaker".to_string())
                .spawn(move || {
                    let host = cpal::default_host();
                    let Some(device) = host.default_output_device() else {
                        let _ = ready_tx.send(Err(AppError::Device(
                            "no default output device".to_string(),
                        )));
                        return;
                    };
                    let stream_config = cpal::StreamConfig {
                        channels: 1,
                        sample_rate: mixer.sample_rate(),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let render_mixer = mixer.clone();
                    let stream = match device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                            render_mixer.render(data);
                        },
                        move |err| error!("audio output stream error: {err}"),
                        None,
                    ) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(AppError::Device(format!(
                                "failed to build output stream: {e}"
                            ))));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AppError::Device(format!(
                            "failed to start output stream: {e}"
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    while let Ok(command) = command_rx.recv() {
                        if matches!(command, StreamCommand::Shutdown) {
                            break;
                        }
                    }
                    drop(stream);
                })
                .map_err(|e| AppError::Device(format!("cannot spawn speaker thread: {}", e)))?;

            ready_rx
                .recv()
                .map_err(|_| AppError::Device("speaker thread exited".to_string()))??;

            self.commands = Some(command_tx);
            self.worker = Some(worker);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(commands) = self.commands.take() {
                let _ = commands.send(StreamCommand::Shutdown);
            }
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}
