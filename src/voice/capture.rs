//! Microphone capture: fixed-size framing, encoding and deferred sending.
//!
//! The device callback only ever does in-memory work: it slices samples
//! into fixed frames, encodes them and pushes them onto an unbounded
//! queue. A separate forwarder task drains the queue in order and sends
//! each frame on whatever transport is current *at send time*. Until the
//! session publishes a transport, frames simply wait in the queue.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::codec::{encode_frame, AudioBlob, EncodedChunk};
use super::device::SampleCallback;
use super::transport::LiveTransport;

/// Default samples per capture frame.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Default capture rate (Live API input is 16 kHz mono).
pub const DEFAULT_CAPTURE_RATE: u32 = 16_000;

/// Latest transport reference, `None` until the session handshake finishes.
pub type TransportSlot = Option<Arc<dyn LiveTransport>>;

/// Slices a continuous sample stream into frames of exactly `frame_size`.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples buffered towards the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append samples and call `emit` for every frame completed.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.frame_size {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }
}

/// Producer half of the capture pipeline, living on the device callback.
pub struct CapturePipeline {
    framer: Framer,
    tx: mpsc::UnboundedSender<EncodedChunk>,
    frames: u64,
}

impl CapturePipeline {
    /// Create the pipeline and the queue its forwarder drains.
    pub fn new(frame_size: usize) -> (Self, mpsc::UnboundedReceiver<EncodedChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                framer: Framer::new(frame_size),
                tx,
                frames: 0,
            },
            rx,
        )
    }

    /// Feed raw device samples. Never blocks.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let tx = &self.tx;
        let frames = &mut self.frames;
        self.framer.push(samples, |frame| {
            *frames += 1;
            // Receiver gone means the session is tearing down; nothing to do.
            let _ = tx.send(encode_frame(frame));
        });
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    /// Box the pipeline as a device sample callback.
    pub fn into_callback(mut self) -> SampleCallback {
        Box::new(move |samples: &[f32]| self.push_samples(samples))
    }
}

/// Drain captured frames in order and send each on the current transport.
///
/// Waits (without dropping anything) while the slot is still `None`.
/// Returns when the queue closes, the slot sender is dropped, or `cancel` fires.
pub async fn forward_frames(
    mut frames: mpsc::UnboundedReceiver<EncodedChunk>,
    mut slot: watch::Receiver<TransportSlot>,
    sample_rate: u32,
    cancel: CancellationToken,
    session_id: String,
) {
    let mut sent: u64 = 0;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.recv() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let transport = loop {
            let current = slot.borrow_and_update().clone();
            if let Some(transport) = current {
                break Some(transport);
            }
            tokio::select! {
                _ = cancel.cancelled() => break None,
                changed = slot.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
            }
        };
        let Some(transport) = transport else {
            break;
        };

        match transport.send_audio(AudioBlob::pcm(chunk, sample_rate)).await {
            Ok(()) => {
                sent += 1;
                if sent == 1 || sent.is_multiple_of(50) {
                    tracing::debug!(session_id = %session_id, frames = sent, "Forwarded capture frames");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to send capture frame");
            }
        }
    }
    tracing::debug!(session_id = %session_id, frames = sent, "Capture forwarder stopped");
}
