//! Process-wide stop signal.
//!
//! Triggering drops the only sender of a crossbeam channel, so every
//! `select!` that includes [`Shutdown::channel`] wakes immediately, and sets
//! an atomic for loops that poll instead.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Owned by the supervisor; fires the signal once.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: Mutex<Option<Sender<()>>>,
    fired: Arc<AtomicBool>,
}

/// Cloned into every worker.
#[derive(Debug, Clone)]
pub struct Shutdown {
    receiver: Receiver<()>,
    fired: Arc<AtomicBool>,
}

pub fn shutdown_pair() -> (ShutdownTrigger, Shutdown) {
    let (sender, receiver) = bounded(0);
    let fired = Arc::new(AtomicBool::new(false));
    (
        ShutdownTrigger {
            sender: Mutex::new(Some(sender)),
            fired: Arc::clone(&fired),
        },
        Shutdown { receiver, fired },
    )
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        // A poisoned lock still holds the sender; take it either way.
        let mut sender = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sender.take();
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once the signal fires.
    pub fn channel(&self) -> &Receiver<()> {
        &self.receiver
    }
}
