// Copyright (c) 2024 Espresso Systems (espressosys.com)
// This file is part of the HotShot Builder Protocol.
//

//! One-shot broadcast signals.
//!
//! A [`Signal`] is backed by an [`async_broadcast`] channel that is never sent on. Firing the
//! signal closes the channel, which wakes every receiver at once, and every receiver created
//! after that observes the closed channel immediately. A fired signal is never reopened; code
//! that needs to signal again replaces it with a fresh one.

use async_broadcast::{broadcast, InactiveReceiver, Sender};

#[derive(Debug, Clone)]
pub struct Signal {
    sender: Sender<()>,
    // kept inactive so it does not hold any message slots, only the ability to subscribe
    receiver: InactiveReceiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (sender, receiver) = broadcast(1);
        Self {
            sender,
            receiver: receiver.deactivate(),
        }
    }

    /// Fire the signal, waking every waiter.
    ///
    /// Returns `false` if the signal had already been fired.
    pub fn fire(&self) -> bool {
        self.sender.close()
    }

    pub fn is_fired(&self) -> bool {
        self.sender.is_closed()
    }

    /// Wait until the signal is fired. Resolves immediately if it already was.
    pub async fn fired(&self) {
        let mut receiver = self.receiver.activate_cloned();
        // nothing is ever broadcast, so the only possible outcome is the closed channel
        let _ = receiver.recv().await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
