//! Default microphone and speaker through cpal.
//!
//! cpal streams are not `Send`, so each one is built, played and dropped
//! on a dedicated thread. The opener blocks until the stream is playing
//! (or failed), then talks to the thread only through a stop channel.
//!
//! Capture downmixes to mono and, when the device cannot run at the
//! requested rate, resamples with rubato. Playback renders a [`Mixer`]
//! clocked at the device rate into every output channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::{mpsc, Arc};
use std::thread;

use super::device::{
    AudioInput, AudioOutput, AudioOutputFactory, CaptureStream, Mixer, SampleCallback,
    ScheduledSource, SourceId,
};
use super::error::LiveError;

/// Input frames per resampler call.
const RESAMPLER_CHUNK: usize = 1024;

// ── Stream thread ─────────────────────────────────────────────────

/// Owns one cpal stream on its own thread until stopped.
struct StreamThread {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Run `build` on a new thread, play the stream and hand back whatever
    /// `build` produced alongside it.
    fn spawn<R, F>(name: &str, build: F) -> Result<(Self, R), String>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<(cpal::Stream, R), String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<R, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, extra) = match build() {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {e}")));
                    return;
                }
                let _ = ready_tx.send(Ok(extra));
                // Sender dropped or stop requested: either way release the device.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| format!("failed to spawn audio thread: {e}"))?;

        match ready_rx.recv() {
            Ok(Ok(extra)) => Ok((
                Self {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                },
                extra,
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err("audio thread exited during setup".into()),
        }
    }

    fn stop(&mut self) -> Result<(), String> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| "audio thread panicked".to_string())?;
        }
        Ok(())
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Narrowest supported config that runs natively at `rate`, preferring f32.
fn config_at_rate(
    configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    rate: u32,
) -> Option<SupportedStreamConfig> {
    configs
        .filter(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        .min_by_key(|c| (c.sample_format() != SampleFormat::F32, c.channels()))
        .map(|c| c.with_sample_rate(cpal::SampleRate(rate)))
}

// ── Capture ───────────────────────────────────────────────────────

/// Downmixes interleaved device audio to mono at the target rate.
struct MonoSink {
    channels: usize,
    resampler: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    on_samples: SampleCallback,
}

impl MonoSink {
    fn new(
        device_rate: u32,
        target_rate: u32,
        channels: usize,
        on_samples: SampleCallback,
    ) -> Result<Self, String> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = f64::from(target_rate) / f64::from(device_rate);
            Some(
                SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                    .map_err(|e| format!("failed to create resampler: {e}"))?,
            )
        };
        Ok(Self {
            channels: channels.max(1),
            resampler,
            pending: Vec::new(),
            on_samples,
        })
    }

    fn push(&mut self, interleaved: &[f32]) {
        let mono = interleaved
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32);

        let Some(resampler) = &mut self.resampler else {
            let mono: Vec<f32> = mono.collect();
            (self.on_samples)(&mono);
            return;
        };

        self.pending.extend(mono);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(out) => {
                    if let Some(channel) = out.first() {
                        (self.on_samples)(channel);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Resampling microphone audio failed"),
            }
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut sink: MonoSink,
) -> Result<cpal::Stream, String>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
                sink.push(&scratch);
            },
            |err| tracing::error!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| format!("failed to build input stream: {e}"))
}

fn open_capture_stream(
    target_rate: u32,
    on_samples: SampleCallback,
) -> Result<(cpal::Stream, ()), String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no default input device".to_string())?;

    let native = device
        .supported_input_configs()
        .ok()
        .and_then(|configs| config_at_rate(configs, target_rate));
    let supported = match native {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| format!("no usable input config: {e}"))?,
    };

    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    tracing::info!(
        device = %device.name().unwrap_or_default(),
        device_rate,
        target_rate,
        channels,
        format = ?supported.sample_format(),
        "Opening microphone"
    );

    let sink = MonoSink::new(device_rate, target_rate, channels, on_samples)?;
    let config = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, sink),
        SampleFormat::I16 => build_input::<i16>(&device, &config, sink),
        SampleFormat::I32 => build_input::<i32>(&device, &config, sink),
        SampleFormat::U16 => build_input::<u16>(&device, &config, sink),
        other => Err(format!("unsupported input sample format {other:?}")),
    }?;
    Ok((stream, ()))
}

/// Default system microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

struct CpalCapture {
    thread: StreamThread,
}

impl CaptureStream for CpalCapture {
    fn stop(&mut self) -> Result<(), LiveError> {
        self.thread
            .stop()
            .map_err(|e| LiveError::Transport(format!("microphone shutdown: {e}")))
    }
}

impl AudioInput for CpalInput {
    fn open(
        &self,
        sample_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn CaptureStream>, LiveError> {
        let (thread, ()) = StreamThread::spawn("billai-capture", move || {
            open_capture_stream(sample_rate, on_samples)
        })
        .map_err(LiveError::PermissionDenied)?;
        Ok(Box::new(CpalCapture { thread }))
    }
}

// ── Playback ──────────────────────────────────────────────────────

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Mixer,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels).max(1);
    let mut mono: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                mixer.render(&mut mono);
                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    for out in frame {
                        *out = T::from_sample(sample);
                    }
                }
            },
            |err| tracing::error!(error = %err, "Speaker stream error"),
            None,
        )
        .map_err(|e| format!("failed to build output stream: {e}"))
}

fn open_playback_stream(preferred_rate: u32) -> Result<(cpal::Stream, Mixer), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no default output device".to_string())?;

    let native = device
        .supported_output_configs()
        .ok()
        .and_then(|configs| config_at_rate(configs, preferred_rate));
    let supported = match native {
        Some(config) => config,
        None => device
            .default_output_config()
            .map_err(|e| format!("no usable output config: {e}"))?,
    };

    let device_rate = supported.sample_rate().0;
    tracing::info!(
        device = %device.name().unwrap_or_default(),
        device_rate,
        preferred_rate,
        channels = supported.channels(),
        format = ?supported.sample_format(),
        "Opening speaker"
    );

    let mixer = Mixer::new(device_rate);
    let config = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, mixer.clone()),
        SampleFormat::I16 => build_output::<i16>(&device, &config, mixer.clone()),
        SampleFormat::I32 => build_output::<i32>(&device, &config, mixer.clone()),
        SampleFormat::U16 => build_output::<u16>(&device, &config, mixer.clone()),
        other => Err(format!("unsupported output sample format {other:?}")),
    }?;
    Ok((stream, mixer))
}

/// Opens the default system speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutputFactory;

/// Speaker stream driving a [`Mixer`].
pub struct CpalOutput {
    mixer: Mixer,
    thread: Mutex<StreamThread>,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn schedule(&self, source: ScheduledSource) -> Result<(), LiveError> {
        self.mixer.schedule(source)
    }

    fn stop_source(&self, id: SourceId) {
        self.mixer.stop_source(id);
    }

    fn close(&self) -> Result<(), LiveError> {
        self.mixer.close()?;
        self.thread
            .lock()
            .stop()
            .map_err(LiveError::PlaybackDeviceUnavailable)
    }
}

impl AudioOutputFactory for CpalOutputFactory {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, LiveError> {
        let (thread, mixer) = StreamThread::spawn("billai-playback", move || {
            open_playback_stream(sample_rate)
        })
        .map_err(LiveError::PlaybackDeviceUnavailable)?;
        Ok(Arc::new(CpalOutput {
            mixer,
            thread: Mutex::new(thread),
        }))
    }
}
