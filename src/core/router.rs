//! Marker router worker.
//!
//! The router is the only thing that starts an epoch. It numbers every
//! marker, registers the sequence with the assembler and broadcasts the
//! window request to every reader. It is also the single writer of the
//! per-label epoch counts, which it updates from the assembler's outcomes.

use crate::config::{EpochSettings, Limits};
use crate::core::reader::SourceHealth;
use crate::core::shutdown::Shutdown;
use crate::core::types::{AssemblerMessage, EpochOutcome, EpochRequest};
use crate::source::{MarkerChannel, MarkerEvent};
use crate::stats::SharedPipelineStats;
use crossbeam_channel::{select, Receiver, Sender};
use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Completed epochs per marker label.
pub type EpochCounts = BTreeMap<String, u64>;

/// Channels the router talks over.
pub struct RouterLinks {
    /// One request sender per reader, in source order
    pub readers: Vec<Sender<EpochRequest>>,
    pub assembler: Sender<AssemblerMessage>,
    pub outcomes: Receiver<EpochOutcome>,
    /// Count snapshot requests; the reply goes to the enclosed sender
    pub count_queries: Receiver<Sender<EpochCounts>>,
    pub health: SourceHealth,
    pub shutdown: Shutdown,
    pub stats: SharedPipelineStats,
}

enum Wake {
    Outcome(EpochOutcome),
    Query(Sender<EpochCounts>),
    Idle,
    Exit,
}

pub struct MarkerRouter {
    channel: Box<dyn MarkerChannel>,
    settings: EpochSettings,
    limits: Limits,
    links: RouterLinks,
    next_sequence: u64,
    outstanding: usize,
    counts: EpochCounts,
    marker_live: bool,
    stalled: bool,
}

impl MarkerRouter {
    pub fn new(
        channel: Box<dyn MarkerChannel>,
        settings: EpochSettings,
        limits: Limits,
        links: RouterLinks,
    ) -> Self {
        Self {
            channel,
            settings,
            limits,
            links,
            next_sequence: 0,
            outstanding: 0,
            counts: EpochCounts::new(),
            marker_live: true,
            stalled: false,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("marker-router".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::debug!(source = %self.channel.info().name, "Marker router started");
        while !self.links.shutdown.is_triggered() {
            self.drain_outcomes();
            self.answer_queries();

            if !self.marker_live {
                if !self.wait() {
                    break;
                }
                continue;
            }

            if self.outstanding >= self.limits.max_outstanding {
                if !self.stalled {
                    tracing::warn!(
                        outstanding = self.outstanding,
                        limit = self.limits.max_outstanding,
                        "Too many outstanding epochs, pausing marker intake"
                    );
                    self.links.stats.record_backpressure_stall();
                    self.stalled = true;
                }
                if !self.wait() {
                    break;
                }
                continue;
            }
            self.stalled = false;

            match self.channel.pull_marker(self.limits.poll_interval) {
                Ok(Some(marker)) => {
                    if !self.route(marker) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Marker source lost, no further epochs will start");
                    self.marker_live = false;
                }
            }
        }
        tracing::debug!(
            markers = self.next_sequence,
            outstanding = self.outstanding,
            "Marker router stopped"
        );
    }

    /// Block for one poll interval on outcomes, queries or shutdown.
    /// Returns false when the router should exit.
    fn wait(&mut self) -> bool {
        let woken = select! {
            recv(self.links.shutdown.channel()) -> _ => Wake::Exit,
            recv(self.links.outcomes) -> outcome => match outcome {
                Ok(outcome) => Wake::Outcome(outcome),
                Err(_) => {
                    tracing::error!("Assembler channel closed");
                    Wake::Exit
                }
            },
            recv(self.links.count_queries) -> query => match query {
                Ok(reply) => Wake::Query(reply),
                Err(_) => Wake::Idle,
            },
            default(self.limits.poll_interval) => Wake::Idle,
        };
        match woken {
            Wake::Exit => return false,
            Wake::Outcome(outcome) => self.apply_outcome(outcome),
            Wake::Query(reply) => {
                let _ = reply.send(self.counts.clone());
            }
            Wake::Idle => {}
        }
        true
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.links.outcomes.try_recv() {
            self.apply_outcome(outcome);
        }
    }

    fn answer_queries(&self) {
        while let Ok(reply) = self.links.count_queries.try_recv() {
            let _ = reply.send(self.counts.clone());
        }
    }

    fn apply_outcome(&mut self, outcome: EpochOutcome) {
        match outcome {
            EpochOutcome::Completed { label, .. } => {
                *self.counts.entry(label).or_insert(0) += 1;
            }
            EpochOutcome::Abandoned { sequence_id, reason } => {
                tracing::debug!(seq = sequence_id, %reason, "Epoch abandoned");
            }
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Returns false when the assembler is gone.
    fn route(&mut self, marker: MarkerEvent) -> bool {
        let sequence_id = self.next_sequence;
        self.next_sequence += 1;
        self.links.stats.record_marker();

        if !self.links.health.all_up() {
            tracing::warn!(
                seq = sequence_id,
                label = %marker.label,
                health = ?self.links.health.snapshot(),
                "Dropping marker while a source is down"
            );
            self.links.stats.record_marker_dropped();
            return true;
        }

        let window = self.settings.resolve(&marker.label);
        let deadline = Instant::now() + self.limits.assembly_timeout(&window);
        let expect = AssemblerMessage::Expect {
            sequence_id,
            label: marker.label.clone(),
            marker_time: marker.timestamp,
            deadline,
        };
        if self.links.assembler.send(expect).is_err() {
            return false;
        }

        let request = EpochRequest {
            sequence_id,
            label: marker.label,
            marker_time: marker.timestamp,
            window,
        };
        tracing::debug!(seq = sequence_id, label = %request.label, t = request.marker_time, "Epoch requested");
        for (index, reader) in self.links.readers.iter().enumerate() {
            if reader.send(request.clone()).is_err() {
                tracing::warn!(seq = sequence_id, source = index, "Reader gone, epoch will time out");
            }
        }
        self.outstanding += 1;
        self.links.stats.record_epoch_requested();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EpochOverride, GlobalEpochSettings};
    use crate::core::shutdown::{shutdown_pair, ShutdownTrigger};
    use crate::core::Mode;
    use crate::error::IncompleteReason;
    use crate::source::{MarkerFeed, MemoryRegistry, SourceInfo, SourceRegistry};
    use crate::stats::create_shared_stats;
    use crossbeam_channel::{bounded, unbounded};
    use std::time::Duration;

    struct Harness {
        feed: MarkerFeed,
        reader_rx: Receiver<EpochRequest>,
        assembler_rx: Receiver<AssemblerMessage>,
        outcome_tx: Sender<EpochOutcome>,
        query_tx: Sender<Sender<EpochCounts>>,
        trigger: ShutdownTrigger,
        handle: JoinHandle<()>,
        stats: SharedPipelineStats,
    }

    impl Harness {
        fn counts(&self) -> EpochCounts {
            let (reply_tx, reply_rx) = bounded(1);
            self.query_tx.send(reply_tx).unwrap();
            reply_rx.recv_timeout(Duration::from_secs(2)).unwrap()
        }

        fn stop(self) {
            self.trigger.trigger();
            self.handle.join().unwrap();
        }
    }

    fn start(max_outstanding: usize, source_up: bool) -> Harness {
        let mut registry = MemoryRegistry::new();
        let info = SourceInfo::markers("markers");
        let feed = registry.add_markers(info.clone());
        let channel = registry.open_markers(&info).unwrap();

        let (reader_tx, reader_rx) = unbounded();
        let (assembler_tx, assembler_rx) = unbounded();
        let (outcome_tx, outcome_rx) = unbounded();
        let (query_tx, query_rx) = unbounded();
        let (health, writers) = SourceHealth::new(1);
        writers[0].set(source_up);
        let (trigger, shutdown) = shutdown_pair();
        let stats = create_shared_stats();

        let settings = EpochSettings::new(GlobalEpochSettings::default()).with_override(
            "long",
            EpochOverride {
                tmax: Some(2.0),
                ..Default::default()
            },
        );
        let limits = Limits {
            max_outstanding,
            poll_interval: Duration::from_millis(5),
            ..Limits::default()
        };
        let links = RouterLinks {
            readers: vec![reader_tx],
            assembler: assembler_tx,
            outcomes: outcome_rx,
            count_queries: query_rx,
            health,
            shutdown,
            stats: stats.clone(),
        };
        let handle = MarkerRouter::new(channel, settings, limits, links)
            .spawn()
            .unwrap();
        Harness {
            feed,
            reader_rx,
            assembler_rx,
            outcome_tx,
            query_tx,
            trigger,
            handle,
            stats,
        }
    }

    #[test]
    fn test_registers_before_broadcast() {
        let harness = start(8, true);
        harness.feed.push_label("A", 1.0);
        harness.feed.push_label("long", 2.0);

        for expected in 0..2u64 {
            let request = harness
                .reader_rx
                .recv_timeout(Duration::from_secs(2))
                .unwrap();
            assert_eq!(request.sequence_id, expected);
            // Expect was sent first, so it is already queued.
            match harness.assembler_rx.try_recv().unwrap() {
                AssemblerMessage::Expect { sequence_id, .. } => assert_eq!(sequence_id, expected),
                other => panic!("expected registration, got {other:?}"),
            }
            if request.label == "long" {
                assert_eq!(request.window.tmax, 2.0);
            }
        }
        harness.stop();
    }

    #[test]
    fn test_counts_follow_completed_outcomes() {
        let harness = start(8, true);
        for (i, label) in ["A", "B", "A"].iter().enumerate() {
            harness.feed.push_label(label, i as f64);
        }
        for _ in 0..3 {
            harness
                .reader_rx
                .recv_timeout(Duration::from_secs(2))
                .unwrap();
        }
        harness
            .outcome_tx
            .send(EpochOutcome::Completed {
                sequence_id: 0,
                label: "A".to_string(),
                mode: Mode::Train,
            })
            .unwrap();
        harness
            .outcome_tx
            .send(EpochOutcome::Abandoned {
                sequence_id: 1,
                reason: IncompleteReason::TimedOut,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let counts = harness.counts();
        assert_eq!(counts.get("A"), Some(&1));
        assert_eq!(counts.get("B"), None);
        harness.stop();
    }

    #[test]
    fn test_drops_markers_while_source_down() {
        let harness = start(8, false);
        harness.feed.push_label("A", 1.0);
        std::thread::sleep(Duration::from_millis(100));

        assert!(harness.reader_rx.try_recv().is_err());
        assert!(harness.assembler_rx.try_recv().is_err());
        let snapshot = harness.stats.snapshot();
        assert_eq!(snapshot.markers_received, 1);
        assert_eq!(snapshot.markers_dropped, 1);
        harness.stop();
    }

    #[test]
    fn test_stalls_at_outstanding_limit() {
        let harness = start(1, true);
        harness.feed.push_label("A", 1.0);
        harness.feed.push_label("B", 2.0);

        let first = harness
            .reader_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(first.sequence_id, 0);
        assert!(harness
            .reader_rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        assert_eq!(harness.stats.snapshot().backpressure_stalls, 1);

        harness
            .outcome_tx
            .send(EpochOutcome::Abandoned {
                sequence_id: 0,
                reason: IncompleteReason::TimedOut,
            })
            .unwrap();
        let second = harness
            .reader_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(second.sequence_id, 1);
        harness.stop();
    }
}
