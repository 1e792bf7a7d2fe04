//! Train/test mode flag.
//!
//! One [`ModeSwitch`] writes, any number of [`ModeFlag`]s read. The switch is
//! not `Clone`, so whoever owns it is the only writer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether completed epochs train the classifier or are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Test,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Test => write!(f, "test"),
        }
    }
}

/// Read side of the mode flag.
#[derive(Debug, Clone)]
pub struct ModeFlag {
    training: Arc<AtomicBool>,
}

impl ModeFlag {
    pub fn get(&self) -> Mode {
        if self.training.load(Ordering::Acquire) {
            Mode::Train
        } else {
            Mode::Test
        }
    }
}

/// Write side of the mode flag.
#[derive(Debug)]
pub struct ModeSwitch {
    training: Arc<AtomicBool>,
}

impl ModeSwitch {
    pub fn new(initial: Mode) -> Self {
        Self {
            training: Arc::new(AtomicBool::new(initial == Mode::Train)),
        }
    }

    /// Set the mode, returning the previous one.
    pub fn set(&self, mode: Mode) -> Mode {
        let was_training = self
            .training
            .swap(mode == Mode::Train, Ordering::AcqRel);
        if was_training {
            Mode::Train
        } else {
            Mode::Test
        }
    }

    pub fn get(&self) -> Mode {
        self.flag().get()
    }

    pub fn flag(&self) -> ModeFlag {
        ModeFlag {
            training: Arc::clone(&self.training),
        }
    }
}
