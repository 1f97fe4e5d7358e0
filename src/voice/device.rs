//! Audio device seams and the software output timeline.
//!
//! The live pipeline never touches a sound card directly. Microphones are
//! reached through [`AudioInput`], speakers through [`AudioOutput`]. Both
//! traits take `&self` so they stay object-safe behind `Arc<dyn _>`.
//!
//! [`Mixer`] implements [`AudioOutput`] on a sample clock: sources are
//! placed on a timeline in seconds and summed when the host pulls samples
//! through [`Mixer::render`]. A real backend (see `device_cpal`) calls
//! `render` from its output callback; tests call it directly to advance
//! time deterministically.

use parking_lot::Mutex;
use std::sync::Arc;

use super::codec::AudioBuffer;
use super::error::LiveError;

/// Callback receiving mono float samples from the microphone.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// One-shot notification fired when a scheduled source finishes on its own.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a scheduled playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

// ── Input ─────────────────────────────────────────────────────────

/// A running microphone stream. Dropping it must also stop capture.
pub trait CaptureStream: Send {
    /// Stop delivering samples and release the device.
    fn stop(&mut self) -> Result<(), LiveError>;
}

/// Abstraction over a microphone.
pub trait AudioInput: Send + Sync {
    /// Open the microphone and start delivering mono samples at `sample_rate`.
    ///
    /// A refused or missing device maps to [`LiveError::PermissionDenied`].
    fn open(
        &self,
        sample_rate: u32,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn CaptureStream>, LiveError>;
}

// ── Output ────────────────────────────────────────────────────────

/// A decoded buffer placed at an absolute output-clock time.
pub struct ScheduledSource {
    pub id: SourceId,
    pub buffer: Arc<AudioBuffer>,
    /// Start time in seconds on the output clock.
    pub start: f64,
    pub on_ended: EndedCallback,
}

/// Abstraction over an output device with a monotonic clock.
pub trait AudioOutput: Send + Sync {
    /// Current output clock in seconds.
    fn current_time(&self) -> f64;

    /// Queue a source. Implementations must not invoke `on_ended` from
    /// inside this call.
    fn schedule(&self, source: ScheduledSource) -> Result<(), LiveError>;

    /// Stop a source immediately. Unknown ids are ignored.
    fn stop_source(&self, id: SourceId);

    /// Release the device. Further scheduling fails.
    fn close(&self) -> Result<(), LiveError>;
}

/// Opens an output device per session.
pub trait AudioOutputFactory: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, LiveError>;
}

// ── Mixer ─────────────────────────────────────────────────────────

struct MixSource {
    id: SourceId,
    buffer: Arc<AudioBuffer>,
    start: f64,
    end: f64,
    on_ended: Option<EndedCallback>,
}

#[derive(Default)]
struct MixerState {
    frames_rendered: u64,
    sources: Vec<MixSource>,
    closed: bool,
}

/// Mono timeline mixer clocked by the number of frames rendered.
#[derive(Clone)]
pub struct Mixer {
    sample_rate: u32,
    state: Arc<Mutex<MixerState>>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(Mutex::new(MixerState::default())),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sources still queued or playing.
    pub fn pending_sources(&self) -> usize {
        self.state.lock().sources.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fill `out` with the next mono samples and advance the clock.
    ///
    /// Sources that finish within this block are removed and their end
    /// callbacks run after the internal lock is released.
    pub fn render(&self, out: &mut [f32]) {
        let rate = f64::from(self.sample_rate);
        let finished = {
            let mut state = self.state.lock();
            let base = state.frames_rendered;

            for (i, slot) in out.iter_mut().enumerate() {
                let t = (base + i as u64) as f64 / rate;
                let mut acc = 0.0f32;
                for src in &state.sources {
                    if t < src.start || t >= src.end {
                        continue;
                    }
                    let pos = (t - src.start) * f64::from(src.buffer.sample_rate());
                    acc += interpolate(&src.buffer, pos);
                }
                *slot = acc.clamp(-1.0, 1.0);
            }

            state.frames_rendered = base + out.len() as u64;
            let now = state.frames_rendered as f64 / rate;

            let mut finished = Vec::new();
            state.sources.retain_mut(|src| {
                if src.end <= now {
                    if let Some(cb) = src.on_ended.take() {
                        finished.push(cb);
                    }
                    false
                } else {
                    true
                }
            });
            finished
        };

        for cb in finished {
            cb();
        }
    }
}

/// Linear interpolation between neighbouring frames of the channel mix.
fn interpolate(buffer: &AudioBuffer, pos: f64) -> f32 {
    let idx = pos.floor() as usize;
    let frac = (pos - pos.floor()) as f32;
    let a = buffer.mixed_sample(idx);
    if frac == 0.0 || idx + 1 >= buffer.frames() {
        return a;
    }
    let b = buffer.mixed_sample(idx + 1);
    a + (b - a) * frac
}

impl AudioOutput for Mixer {
    fn current_time(&self) -> f64 {
        self.state.lock().frames_rendered as f64 / f64::from(self.sample_rate)
    }

    fn schedule(&self, source: ScheduledSource) -> Result<(), LiveError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LiveError::PlaybackDeviceUnavailable(
                "output already closed".into(),
            ));
        }
        let end = source.start + source.buffer.duration();
        state.sources.push(MixSource {
            id: source.id,
            buffer: source.buffer,
            start: source.start,
            end,
            on_ended: Some(source.on_ended),
        });
        Ok(())
    }

    fn stop_source(&self, id: SourceId) {
        self.state.lock().sources.retain(|src| src.id != id);
    }

    fn close(&self) -> Result<(), LiveError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.sources.clear();
        Ok(())
    }
}
