// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! Cancellation and deadlines.
//!
//! A [`Context`] is handed to anything that may have to give up waiting: readers of a
//! [`HeightGate`](crate::HeightGate) and proposal builds. Contexts form a tree, a derived context
//! is done as soon as it is cancelled itself, any of its ancestors is cancelled, or the earliest
//! deadline along the chain passes.

use crate::signal::Signal;
use async_std::task;
use futures::future;
use snafu::Snafu;
use std::time::{Duration, Instant};

/// Why a [`Context`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ContextError {
    #[snafu(display("context cancelled"))]
    Cancelled,
    #[snafu(display("context deadline exceeded"))]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    /// cancellation signals of every ancestor, then our own
    signals: Vec<Signal>,
    /// earliest deadline along the chain
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle(Signal);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.fire();
    }
}

impl Context {
    /// A context that is never done.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.derive(self.deadline)
    }

    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        self.derive(Some(deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn derive(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let signal = Signal::new();
        let mut signals = self.signals.clone();
        signals.push(signal.clone());
        (Context { signals, deadline }, CancelHandle(signal))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` while the context is live, otherwise the reason it is done.
    pub fn err(&self) -> Option<ContextError> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Some(ContextError::DeadlineExceeded);
        }
        if self.signals.iter().any(Signal::is_fired) {
            return Some(ContextError::Cancelled);
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is done.
    pub async fn done(&self) {
        let cancelled = async {
            if self.signals.is_empty() {
                future::pending::<()>().await;
            } else {
                future::select_all(self.signals.iter().map(|signal| Box::pin(signal.fired())))
                    .await;
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => {
                    task::sleep(deadline.saturating_duration_since(Instant::now())).await
                }
                None => future::pending::<()>().await,
            }
        };

        future::select(Box::pin(cancelled), Box::pin(expired)).await;
    }
}
