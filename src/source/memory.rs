//! In-memory registry fed through channels.
//!
//! Each registered stream hands back a feed; whatever is pushed into the
//! feed is what the pipeline reads. Dropping or disconnecting a feed
//! disconnects the stream; a data feed can later come back online.

use super::{MarkerChannel, SampleChannel, SourceRegistry};
use crate::error::AcquisitionError;
use crate::source::types::{MarkerEvent, SampleChunk, SourceInfo};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Receiver a data stream currently delivers to. Replaced on every reconnect.
type SampleSlot = Arc<Mutex<Receiver<SampleChunk>>>;

/// Producer side of an in-memory data stream.
#[derive(Debug)]
pub struct SampleFeed {
    sender: Option<Sender<SampleChunk>>,
    slot: SampleSlot,
}

impl SampleFeed {
    /// Push a chunk. Returns false while disconnected or once every reader is gone.
    pub fn push(&self, chunk: SampleChunk) -> bool {
        self.sender
            .as_ref()
            .map_or(false, |sender| sender.send(chunk).is_ok())
    }

    /// Take the stream offline. Readers see a disconnect once they drain
    /// what was already pushed.
    pub fn disconnect(&mut self) {
        self.sender = None;
    }

    /// Bring the stream back on a fresh channel. Open channels pick it up on
    /// their next reconnect attempt.
    pub fn reconnect(&mut self) {
        let (sender, receiver) = unbounded();
        match self.slot.lock() {
            Ok(mut current) => *current = receiver,
            Err(poisoned) => *poisoned.into_inner() = receiver,
        }
        self.sender = Some(sender);
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some()
    }
}

/// Producer side of an in-memory marker stream.
#[derive(Debug, Clone)]
pub struct MarkerFeed {
    sender: Sender<MarkerEvent>,
}

impl MarkerFeed {
    pub fn push(&self, marker: MarkerEvent) -> bool {
        self.sender.send(marker).is_ok()
    }

    pub fn push_label(&self, label: &str, timestamp: f64) -> bool {
        self.push(MarkerEvent::new(label, timestamp))
    }
}

enum Stream {
    Samples(SampleSlot),
    Markers(Receiver<MarkerEvent>),
}

/// Registry of scripted in-memory streams.
#[derive(Default)]
pub struct MemoryRegistry {
    streams: Vec<(SourceInfo, Stream)>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data stream and get the feed that drives it.
    pub fn add_source(&mut self, info: SourceInfo) -> SampleFeed {
        let (sender, receiver) = unbounded();
        let slot = Arc::new(Mutex::new(receiver));
        self.streams.push((info, Stream::Samples(Arc::clone(&slot))));
        SampleFeed {
            sender: Some(sender),
            slot,
        }
    }

    /// Register a marker stream and get the feed that drives it.
    pub fn add_markers(&mut self, info: SourceInfo) -> MarkerFeed {
        let (sender, receiver) = unbounded();
        self.streams.push((info, Stream::Markers(receiver)));
        MarkerFeed { sender }
    }

    fn find(&self, info: &SourceInfo) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|(candidate, _)| candidate.name == info.name)
            .map(|(_, stream)| stream)
    }
}

impl SourceRegistry for MemoryRegistry {
    fn list_available(&self, type_filter: &[String]) -> Vec<SourceInfo> {
        self.streams
            .iter()
            .map(|(info, _)| info)
            .filter(|info| type_filter.is_empty() || type_filter.contains(&info.source_type))
            .cloned()
            .collect()
    }

    fn open(&self, info: &SourceInfo) -> Result<Box<dyn SampleChannel>, AcquisitionError> {
        match self.find(info) {
            Some(Stream::Samples(slot)) => Ok(Box::new(MemorySampleChannel {
                info: info.clone(),
                receiver: current_receiver(slot),
                slot: Arc::clone(slot),
            })),
            _ => Err(AcquisitionError::Open {
                name: info.name.clone(),
                reason: "no data stream with this name".to_string(),
            }),
        }
    }

    fn open_markers(&self, info: &SourceInfo) -> Result<Box<dyn MarkerChannel>, AcquisitionError> {
        match self.find(info) {
            Some(Stream::Markers(receiver)) => Ok(Box::new(MemoryMarkerChannel {
                info: info.clone(),
                receiver: receiver.clone(),
            })),
            _ => Err(AcquisitionError::Open {
                name: info.name.clone(),
                reason: "no marker stream with this name".to_string(),
            }),
        }
    }
}

fn current_receiver(slot: &SampleSlot) -> Receiver<SampleChunk> {
    match slot.lock() {
        Ok(receiver) => receiver.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

struct MemorySampleChannel {
    info: SourceInfo,
    receiver: Receiver<SampleChunk>,
    slot: SampleSlot,
}

impl SampleChannel for MemorySampleChannel {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn pull_chunk(&mut self, timeout: Duration) -> Result<Option<SampleChunk>, AcquisitionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AcquisitionError::Disconnected(self.info.name.clone()))
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), AcquisitionError> {
        let receiver = current_receiver(&self.slot);
        if receiver.same_channel(&self.receiver) {
            return Err(AcquisitionError::Disconnected(self.info.name.clone()));
        }
        self.receiver = receiver;
        Ok(())
    }
}

struct MemoryMarkerChannel {
    info: SourceInfo,
    receiver: Receiver<MarkerEvent>,
}

impl MarkerChannel for MemoryMarkerChannel {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn pull_marker(&mut self, timeout: Duration) -> Result<Option<MarkerEvent>, AcquisitionError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(marker) => Ok(Some(marker)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(AcquisitionError::Disconnected(self.info.name.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_reaches_channel() {
        let mut registry = MemoryRegistry::new();
        let info = SourceInfo::new("eeg", "EEG", 2, 100.0);
        let feed = registry.add_source(info.clone());

        let mut channel = registry.open(&info).unwrap();
        assert!(feed.push(SampleChunk::regular(0.0, 100.0, 10, 2, |_, _| 0.0)));

        let chunk = channel.pull_chunk(Duration::from_millis(10)).unwrap();
        assert_eq!(chunk.map(|c| c.len()), Some(10));
        assert_eq!(channel.pull_chunk(Duration::from_millis(1)).unwrap(), None);
    }

    #[test]
    fn test_dropped_feed_disconnects() {
        let mut registry = MemoryRegistry::new();
        let info = SourceInfo::new("eeg", "EEG", 1, 100.0);
        let feed = registry.add_source(info.clone());
        let mut channel = registry.open(&info).unwrap();

        drop(feed);
        assert_eq!(
            channel.pull_chunk(Duration::from_millis(1)),
            Err(AcquisitionError::Disconnected("eeg".to_string()))
        );
        assert!(channel.reconnect().is_err());
    }

    #[test]
    fn test_feed_comes_back_after_reconnect() {
        let mut registry = MemoryRegistry::new();
        let info = SourceInfo::new("eeg", "EEG", 1, 100.0);
        let mut feed = registry.add_source(info.clone());
        let mut channel = registry.open(&info).unwrap();

        feed.disconnect();
        assert!(!feed.is_connected());
        assert!(!feed.push(SampleChunk::regular(0.0, 100.0, 10, 1, |_, _| 0.0)));
        assert!(channel.pull_chunk(Duration::from_millis(1)).is_err());
        assert!(channel.reconnect().is_err());

        feed.reconnect();
        assert!(channel.reconnect().is_ok());
        assert!(feed.push(SampleChunk::regular(1.0, 100.0, 10, 1, |_, _| 0.0)));
        let chunk = channel.pull_chunk(Duration::from_millis(10)).unwrap();
        assert_eq!(chunk.map(|c| c.len()), Some(10));

        // Channels opened after the reconnect read the new stream directly.
        let mut reopened = registry.open(&info).unwrap();
        assert!(feed.push(SampleChunk::regular(1.1, 100.0, 5, 1, |_, _| 0.0)));
        let chunk = reopened.pull_chunk(Duration::from_millis(10)).unwrap();
        assert_eq!(chunk.map(|c| c.len()), Some(5));
    }

    #[test]
    fn test_type_filter() {
        let mut registry = MemoryRegistry::new();
        let _eeg = registry.add_source(SourceInfo::new("eeg", "EEG", 1, 100.0));
        let _markers = registry.add_markers(SourceInfo::markers("markers"));

        assert_eq!(registry.list_available(&[]).len(), 2);
        let markers = registry.list_available(&["Markers".to_string()]);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].name, "markers");

        assert!(registry.open(&markers[0]).is_err());
        assert!(registry.open_markers(&markers[0]).is_ok());
    }
}
