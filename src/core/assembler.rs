//! Feature assembler worker.
//!
//! Joins the per-source slices of each sequence in a table keyed by
//! sequence id. Sequences are independent: one waiting on a slow source
//! never holds up another that is already complete.

use crate::core::features::FeatureExtractor;
use crate::core::mode::{Mode, ModeFlag};
use crate::core::shutdown::Shutdown;
use crate::core::types::{AssemblerMessage, EpochOutcome, EpochSlice, FeatureVector};
use crate::error::{EpochIncomplete, IncompleteReason};
use crate::stats::SharedPipelineStats;
use crossbeam_channel::{select, Receiver, Sender};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Channels the assembler talks over.
pub struct AssemblerLinks {
    /// Registrations from the router and slices from every reader
    pub inbox: Receiver<AssemblerMessage>,
    pub outcomes: Sender<EpochOutcome>,
    pub train: Sender<FeatureVector>,
    pub test: Sender<FeatureVector>,
    pub mode: ModeFlag,
    pub shutdown: Shutdown,
    pub stats: SharedPipelineStats,
}

/// A sequence waiting for its slices.
struct PartialEpoch {
    label: String,
    marker_time: f64,
    deadline: Instant,
    slots: Vec<Option<EpochSlice>>,
    filled: usize,
}

enum Wake {
    Message(AssemblerMessage),
    Idle,
    Stop,
}

pub struct FeatureAssembler {
    source_count: usize,
    extractor: Box<dyn FeatureExtractor>,
    poll_interval: Duration,
    links: AssemblerLinks,
    table: HashMap<u64, PartialEpoch>,
}

impl FeatureAssembler {
    pub fn new(
        source_count: usize,
        extractor: Box<dyn FeatureExtractor>,
        poll_interval: Duration,
        links: AssemblerLinks,
    ) -> Self {
        Self {
            source_count,
            extractor,
            poll_interval,
            links,
            table: HashMap::new(),
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("feature-assembler".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::debug!(sources = self.source_count, extractor = self.extractor.name(), "Feature assembler started");
        while !self.links.shutdown.is_triggered() {
            let wake = select! {
                recv(self.links.shutdown.channel()) -> _ => Wake::Stop,
                recv(self.links.inbox) -> message => message.map_or(Wake::Stop, Wake::Message),
                default(self.poll_interval) => Wake::Idle,
            };
            match wake {
                Wake::Message(message) => {
                    if !self.handle(message) {
                        break;
                    }
                }
                Wake::Idle => {}
                Wake::Stop => break,
            }
            self.evict_expired(Instant::now());
        }
        tracing::debug!(pending = self.table.len(), "Feature assembler stopped");
    }

    /// Returns false when shutdown interrupted a queue send.
    fn handle(&mut self, message: AssemblerMessage) -> bool {
        match message {
            AssemblerMessage::Expect {
                sequence_id,
                label,
                marker_time,
                deadline,
            } => {
                self.table.insert(
                    sequence_id,
                    PartialEpoch {
                        label,
                        marker_time,
                        deadline,
                        slots: vec![None; self.source_count],
                        filled: 0,
                    },
                );
                true
            }
            AssemblerMessage::Slice(slice) => self.accept_slice(slice),
            AssemblerMessage::Incomplete {
                sequence_id,
                source_index,
                reason,
            } => {
                if self.table.remove(&sequence_id).is_some() {
                    let incomplete = EpochIncomplete {
                        sequence_id,
                        source_index,
                        reason,
                    };
                    tracing::info!(seq = sequence_id, source = source_index, "{incomplete}");
                    self.abandon(sequence_id, reason);
                }
                true
            }
        }
    }

    fn accept_slice(&mut self, slice: EpochSlice) -> bool {
        let sequence_id = slice.sequence_id;
        let Some(record) = self.table.get_mut(&sequence_id) else {
            tracing::debug!(seq = sequence_id, source = slice.source_index, "Discarding slice for unknown sequence");
            return true;
        };
        let Some(slot) = record.slots.get_mut(slice.source_index) else {
            tracing::warn!(seq = sequence_id, source = slice.source_index, "Slice from unknown source");
            return true;
        };
        if slot.is_some() {
            tracing::warn!(seq = sequence_id, source = slice.source_index, "Duplicate slice ignored");
            return true;
        }
        *slot = Some(slice);
        record.filled += 1;
        if record.filled < self.source_count {
            return true;
        }
        match self.table.remove(&sequence_id) {
            Some(record) => self.complete(sequence_id, record),
            None => true,
        }
    }

    fn complete(&mut self, sequence_id: u64, record: PartialEpoch) -> bool {
        let slices: Vec<EpochSlice> = record.slots.into_iter().flatten().collect();
        let values = self.extractor.extract(&slices);
        let mode = self.links.mode.get();
        let vector = FeatureVector {
            sequence_id,
            label: record.label.clone(),
            mode,
            marker_time: record.marker_time,
            values,
        };
        let queue = match mode {
            Mode::Train => &self.links.train,
            Mode::Test => &self.links.test,
        };
        let delivered = select! {
            send(queue, vector) -> sent => sent.is_ok(),
            recv(self.links.shutdown.channel()) -> _ => return false,
        };
        if !delivered {
            tracing::error!(seq = sequence_id, %mode, "Classifier queue closed, vector lost");
            self.abandon(sequence_id, IncompleteReason::ClassifierUnavailable);
            return true;
        }

        tracing::debug!(seq = sequence_id, label = %record.label, %mode, "Feature vector assembled");
        self.links.stats.record_vector_assembled();
        match mode {
            Mode::Train => self.links.stats.record_train_vector(),
            Mode::Test => self.links.stats.record_test_vector(),
        }
        let _ = self.links.outcomes.send(EpochOutcome::Completed {
            sequence_id,
            label: record.label,
            mode,
        });
        true
    }

    fn abandon(&self, sequence_id: u64, reason: IncompleteReason) {
        self.links.stats.record_sequence_abandoned();
        let _ = self
            .links
            .outcomes
            .send(EpochOutcome::Abandoned { sequence_id, reason });
    }

    fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .table
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for sequence_id in expired {
            if let Some(record) = self.table.remove(&sequence_id) {
                tracing::warn!(
                    seq = sequence_id,
                    label = %record.label,
                    received = record.filled,
                    expected = self.source_count,
                    "Epoch not assembled before its deadline"
                );
                self.abandon(sequence_id, IncompleteReason::AssemblyTimeout);
            }
        }
    }
}
