//! Gapless playback scheduling for streamed model audio.
//!
//! Server audio arrives as discrete messages. Each decoded chunk is placed
//! at `max(cursor, now)` on the output clock and the cursor moves to its
//! end, so consecutive chunks play back-to-back regardless of network
//! jitter. Barge-in calls [`PlaybackScheduler::interrupt`], which stops
//! everything queued and resets the cursor.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::codec::{decode_chunk, AudioBuffer, EncodedChunk};
use super::device::{AudioOutput, ScheduledSource, SourceId};
use super::error::LiveError;

/// Rate of the spoken replies (Live API output is 24 kHz mono).
pub const DEFAULT_PLAYBACK_RATE: u32 = 24_000;

/// One buffer queued on the output device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    /// Scheduled start, in output-clock seconds.
    pub start: f64,
    /// `start + duration`.
    pub end: f64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    cursor: f64,
    next_id: u64,
    active: BTreeMap<SourceId, PlaybackSource>,
}

/// Schedules decoded chunks back-to-back and tracks what is still audible.
///
/// Chunk arrival and natural end-of-playback may run on different threads
/// (network task vs. device callback), so all state sits behind one lock.
pub struct PlaybackScheduler {
    output: Option<Arc<dyn AudioOutput>>,
    sample_rate: u32,
    channels: u16,
    state: Arc<Mutex<SchedulerState>>,
}

impl PlaybackScheduler {
    /// Scheduler for `channels`-channel PCM at `sample_rate`.
    ///
    /// `output` is `None` when no device could be opened; every enqueue
    /// then reports [`LiveError::PlaybackDeviceUnavailable`].
    pub fn new(output: Option<Arc<dyn AudioOutput>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            output,
            sample_rate,
            channels,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Decode and schedule one server audio chunk.
    pub fn enqueue(&self, chunk: &EncodedChunk) -> Result<PlaybackSource, LiveError> {
        let buffer = decode_chunk(chunk, self.sample_rate, self.channels)?;
        self.enqueue_buffer(buffer)
    }

    /// Schedule an already decoded buffer.
    pub fn enqueue_buffer(&self, buffer: AudioBuffer) -> Result<PlaybackSource, LiveError> {
        let output = self.output.as_ref().ok_or_else(|| {
            LiveError::PlaybackDeviceUnavailable("no output device for this session".into())
        })?;

        let duration = buffer.duration();
        let mut state = self.state.lock();
        let start = state.cursor.max(output.current_time());
        let id = SourceId(state.next_id);

        output.schedule(ScheduledSource {
            id,
            buffer: Arc::new(buffer),
            start,
            on_ended: release_on_end(Arc::downgrade(&self.state), id),
        })?;

        state.next_id += 1;
        state.cursor = start + duration;
        let source = PlaybackSource {
            id,
            start,
            end: start + duration,
        };
        state.active.insert(id, source);

        tracing::trace!(
            source = id.0,
            start,
            duration,
            active = state.active.len(),
            "Scheduled playback chunk"
        );
        Ok(source)
    }

    /// Stop every queued source and reset the cursor to zero.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        let stopped = state.active.len();
        if let Some(output) = &self.output {
            for id in state.active.keys() {
                output.stop_source(*id);
            }
        }
        state.active.clear();
        state.cursor = 0.0;
        tracing::debug!(stopped, "Playback interrupted");
    }

    /// Interrupt and release the output device.
    pub fn close(&self) -> Result<(), LiveError> {
        self.interrupt();
        match &self.output {
            Some(output) => output.close(),
            None => Ok(()),
        }
    }

    pub fn cursor(&self) -> f64 {
        self.state.lock().cursor
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Snapshot of the active set in scheduling order.
    pub fn active_sources(&self) -> Vec<PlaybackSource> {
        self.state.lock().active.values().copied().collect()
    }
}

/// End callback that drops `id` from the active set, if the scheduler still exists.
fn release_on_end(
    state: Weak<Mutex<SchedulerState>>,
    id: SourceId,
) -> Box<dyn FnOnce() + Send + 'static> {
    Box::new(move || {
        if let Some(state) = state.upgrade() {
            state.lock().active.remove(&id);
        }
    })
}
