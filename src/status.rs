// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Lifecycle state shared by workers and the server.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// `Stopped -> Starting -> Started -> Stopping -> Stopped`, with `Disposed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Disposed = 0,
    Stopped = 1,
    Stopping = 2,
    Starting = 3,
    Started = 4,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Stopped,
            2 => Status::Stopping,
            3 => Status::Starting,
            4 => Status::Started,
            _ => Status::Disposed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Disposed => "Disposed",
            Status::Stopped => "Stopped",
            Status::Stopping => "Stopping",
            Status::Starting => "Starting",
            Status::Started => "Started",
        };
        f.write_str(name)
    }
}

/// Atomic holder of a `Status`.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: Status) -> StatusCell {
        StatusCell(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`; `false` when the current status is not `from`.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sets `status` unless the cell is already `Disposed`.
    pub fn set(&self, status: Status) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == Status::Disposed as u8 {
                    None
                } else {
                    Some(status as u8)
                }
            });
    }

    /// Unconditionally stores `status`, returning the previous one.
    pub fn replace(&self, status: Status) -> Status {
        Status::from_u8(self.0.swap(status as u8, Ordering::AcqRel))
    }
}

impl fmt::Display for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.get(), f)
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        StatusCell::new(Status::Stopped)
    }
}

/// Operation requested to the server control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerOperation {
    #[default]
    NoOp,
    Stop,
    Restart,
}
