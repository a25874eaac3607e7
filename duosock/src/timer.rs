//! Per-operation deadlines
//!
//! A `Timer` is plain state owned by the engine; its `expired()` future is
//! polled from the engine loop and never resolves while the timer is
//! disarmed or paused. Expiry hands control to the extension protocol:
//! the engine pauses the timer, asks the owner for more time, then either
//! `extend`s it or fails the operation.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    deadline: Option<Instant>,
    paused: bool,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing an operation; `None` means it never times out
    pub fn start(&mut self, timeout: Option<Duration>) {
        let now = Instant::now();
        self.started = Some(now);
        self.deadline = timeout.map(|t| now + t);
        self.paused = false;
    }

    /// Disarm and forget the operation
    pub fn cancel(&mut self) {
        *self = Self::default();
    }

    /// Stop the deadline from firing while an extension is requested
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Re-arm `by` from now and resume
    pub fn extend(&mut self, by: Duration) {
        self.deadline = Some(Instant::now() + by);
        self.paused = false;
    }

    /// Time since the operation started
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some() && !self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Resolve once the deadline passes
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) if !self.paused => tokio::time::sleep_until(deadline).await,
            _ => std::future::pending().await,
        }
    }
}
