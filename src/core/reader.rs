//! Source reader worker.
//!
//! One thread per data source. It keeps the source's [`ChannelBuffer`]
//! filled, cuts epoch windows for the requests the router broadcasts and
//! hands slices to the assembler. A lost source fails its pending requests
//! and keeps trying to reconnect until shutdown.

use crate::config::Limits;
use crate::core::buffer::{ChannelBuffer, WindowStatus};
use crate::core::shutdown::Shutdown;
use crate::core::types::{AssemblerMessage, EpochRequest, EpochSlice};
use crate::error::{AcquisitionError, IncompleteReason};
use crate::source::SampleChannel;
use crate::stats::SharedPipelineStats;
use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Read side of the per-source health table.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    slots: Arc<[AtomicBool]>,
}

/// Write handle for one health slot. Each reader owns exactly one.
#[derive(Debug)]
pub struct HealthSlot {
    slots: Arc<[AtomicBool]>,
    index: usize,
}

impl SourceHealth {
    /// Create a table with every source up, plus one writer per slot.
    pub fn new(count: usize) -> (Self, Vec<HealthSlot>) {
        let slots: Arc<[AtomicBool]> = (0..count)
            .map(|_| AtomicBool::new(true))
            .collect::<Vec<_>>()
            .into();
        let writers = (0..count)
            .map(|index| HealthSlot {
                slots: Arc::clone(&slots),
                index,
            })
            .collect();
        (Self { slots }, writers)
    }

    /// Whether the reader at `index` currently has a live channel. Unknown
    /// indices read as down.
    pub fn is_up(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map_or(false, |slot| slot.load(Ordering::Acquire))
    }

    /// True when every reader has a live channel.
    pub fn all_up(&self) -> bool {
        self.slots.iter().all(|slot| slot.load(Ordering::Acquire))
    }

    /// Current state of every slot, in source order.
    pub fn snapshot(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }
}

impl HealthSlot {
    /// Source index this slot writes.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publish the reader's channel state to the router.
    pub fn set(&self, up: bool) {
        self.slots[self.index].store(up, Ordering::Release);
    }
}

/// Everything a reader needs besides its channel.
pub struct ReaderLinks {
    pub requests: Receiver<EpochRequest>,
    pub assembler: Sender<AssemblerMessage>,
    pub health: HealthSlot,
    pub shutdown: Shutdown,
    pub stats: SharedPipelineStats,
}

struct PendingRequest {
    request: EpochRequest,
    deadline: Instant,
}

/// Worker owning one data source.
pub struct SourceReader {
    index: usize,
    channel: Box<dyn SampleChannel>,
    dropped_channels: Vec<usize>,
    buffer: ChannelBuffer,
    limits: Limits,
    links: ReaderLinks,
    pending: VecDeque<PendingRequest>,
    connected: bool,
    last_reconnect: Instant,
}

impl SourceReader {
    /// `retention` is the history, in seconds, the buffer keeps behind its newest sample.
    pub fn new(
        channel: Box<dyn SampleChannel>,
        dropped_channels: Vec<usize>,
        retention: f64,
        limits: Limits,
        links: ReaderLinks,
    ) -> Self {
        let info = channel.info();
        let kept = info.channel_count().saturating_sub(dropped_channels.len());
        let buffer = ChannelBuffer::new(kept, info.nominal_srate, retention);
        Self {
            index: links.health.index(),
            channel,
            dropped_channels,
            buffer,
            limits,
            links,
            pending: VecDeque::new(),
            connected: true,
            last_reconnect: Instant::now(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("reader-{}", self.index))
            .spawn(move || self.run())
    }

    fn name(&self) -> &str {
        &self.channel.info().name
    }

    fn run(mut self) {
        tracing::debug!(source = self.name(), index = self.index, "Source reader started");
        while !self.links.shutdown.is_triggered() {
            if self.connected {
                self.pull();
            } else if !self.wait_and_reconnect() {
                break;
            }
            if !self.drain_requests() || !self.resolve_pending() {
                break;
            }
            let oldest = self
                .pending
                .iter()
                .map(|p| p.request.start())
                .fold(None, |acc: Option<f64>, start| {
                    Some(acc.map_or(start, |a| a.min(start)))
                });
            self.buffer.evict(oldest);
        }
        tracing::debug!(source = self.name(), "Source reader stopped");
    }

    fn pull(&mut self) {
        match self.channel.pull_chunk(self.limits.poll_interval) {
            Ok(Some(mut chunk)) => {
                chunk.drop_channels(&self.dropped_channels);
                let rejected_before = self.buffer.rejected_readings();
                let accepted = self.buffer.push_chunk(&chunk);
                let rejected = self.buffer.rejected_readings() - rejected_before;
                if rejected > 0 {
                    tracing::warn!(source = self.name(), rejected, "Rejected malformed readings");
                }
                self.links.stats.record_chunk(accepted as u64, rejected);
            }
            Ok(None) => {}
            Err(e) => self.disconnect(e),
        }
    }

    fn disconnect(&mut self, error: AcquisitionError) {
        tracing::warn!(source = self.name(), error = %error, "Source lost");
        self.connected = false;
        self.last_reconnect = Instant::now();
        self.links.health.set(false);
        self.links.stats.record_source_disconnect();
        while let Some(pending) = self.pending.pop_front() {
            if !self.send_incomplete(pending.request.sequence_id, IncompleteReason::SourceUnavailable) {
                break;
            }
        }
    }

    /// Sleep one poll interval, then retry the connection when due.
    /// Returns false once shutdown fires.
    fn wait_and_reconnect(&mut self) -> bool {
        select! {
            recv(self.links.shutdown.channel()) -> _ => return false,
            default(self.limits.poll_interval) => {}
        }
        if self.last_reconnect.elapsed() < self.limits.reconnect_interval {
            return true;
        }
        self.last_reconnect = Instant::now();
        match self.channel.reconnect() {
            Ok(()) => {
                tracing::info!(source = self.name(), "Source reconnected");
                self.buffer.clear();
                self.connected = true;
                self.links.health.set(true);
                self.links.stats.record_source_reconnect();
            }
            Err(e) => tracing::debug!(source = self.name(), error = %e, "Reconnect failed"),
        }
        true
    }

    /// Move new requests into the pending queue. Returns false when the assembler is gone.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.links.requests.try_recv() {
                Ok(request) => {
                    if !self.connected {
                        if !self.send_incomplete(request.sequence_id, IncompleteReason::SourceUnavailable) {
                            return false;
                        }
                        continue;
                    }
                    let deadline = Instant::now() + self.limits.slice_timeout(&request.window);
                    self.pending.push_back(PendingRequest { request, deadline });
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Resolve pending requests from the front of the queue. A request still
    /// waiting for samples holds back everything behind it, so slices leave in
    /// sequence order. Returns false when the assembler is gone.
    fn resolve_pending(&mut self) -> bool {
        let now = Instant::now();
        while let Some(pending) = self.pending.front() {
            let request = &pending.request;
            let sent = match self.buffer.extract(request) {
                WindowStatus::Ready(channels) => {
                    let sample_count = channels.first().map_or(0, Vec::len);
                    let slice = EpochSlice {
                        sequence_id: request.sequence_id,
                        source_index: self.index,
                        sample_rate: sample_count as f64 / request.window.span(),
                        channels,
                        start: request.start(),
                        end: request.end(),
                    };
                    tracing::trace!(seq = slice.sequence_id, source = self.index, "Slice ready");
                    self.links.stats.record_slice_completed();
                    self.links.assembler.send(AssemblerMessage::Slice(slice)).is_ok()
                }
                WindowStatus::InsufficientHistory => {
                    self.send_incomplete(request.sequence_id, IncompleteReason::InsufficientHistory)
                }
                WindowStatus::Pending if now >= pending.deadline => {
                    self.send_incomplete(request.sequence_id, IncompleteReason::TimedOut)
                }
                WindowStatus::Pending => return true,
            };
            self.pending.pop_front();
            if !sent {
                return false;
            }
        }
        true
    }

    fn send_incomplete(&self, sequence_id: u64, reason: IncompleteReason) -> bool {
        tracing::debug!(seq = sequence_id, source = self.index, %reason, "Slice incomplete");
        self.links.stats.record_slice_incomplete();
        self.links
            .assembler
            .send(AssemblerMessage::Incomplete {
                sequence_id,
                source_index: self.index,
                reason,
            })
            .is_ok()
    }
}
