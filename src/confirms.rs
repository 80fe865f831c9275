// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirm Tracking
//!
//! Every publish on a confirm-mode channel gets a sequence number that the
//! broker later acks or nacks. The tracker records each number before the
//! frame is written and forgets it when the confirmation arrives.
//!
//! Sequence numbers are only unique within one channel, so entries are kept
//! per channel key. A key names one channel instance, so a channel recreated
//! under the same logical name starts a fresh key. One mutex guards the
//! whole tracker: removal and counters change under a single guard, and
//! every ack/nack is serialized regardless of the channel it came from.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct ConfirmState {
    pending: HashMap<String, BTreeSet<u64>>,
    acked: u64,
    nacked: u64,
}

impl ConfirmState {
    fn remove(&mut self, channel: &str, tag: u64, multiple: bool) -> usize {
        let Some(pending) = self.pending.get_mut(channel) else {
            return 0;
        };

        let removed = if multiple {
            let keep = match tag.checked_add(1) {
                Some(first_kept) => pending.split_off(&first_kept),
                None => BTreeSet::new(),
            };
            let removed = pending.len();
            *pending = keep;
            removed
        } else {
            usize::from(pending.remove(&tag))
        };

        if pending.is_empty() {
            self.pending.remove(channel);
        }

        removed
    }
}

/// Publish sequence numbers still waiting for a broker confirmation.
#[derive(Debug, Default)]
pub struct OutstandingConfirms {
    state: Mutex<ConfirmState>,
    drained: Notify,
}

impl OutstandingConfirms {
    pub fn new() -> OutstandingConfirms {
        OutstandingConfirms::default()
    }

    /// Records `sequence` as sent on `channel`.
    pub fn track(&self, channel: &str, sequence: u64) {
        let mut state = self.state.lock();
        state
            .pending
            .entry(channel.to_owned())
            .or_default()
            .insert(sequence);
    }

    /// Handles a broker ack. With `multiple` every entry up to and including
    /// `tag` is confirmed. Returns how many entries were removed.
    pub fn ack(&self, channel: &str, tag: u64, multiple: bool) -> usize {
        debug!(channel, tag, multiple, "confirming message");
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove(channel, tag, multiple);
            state.acked += removed as u64;
            removed
        };
        self.notify_if_drained();
        removed
    }

    /// Handles a broker nack; same removal rules as [`OutstandingConfirms::ack`].
    pub fn nack(&self, channel: &str, tag: u64, multiple: bool) -> usize {
        debug!(channel, tag, multiple, "message nack-ed by broker");
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove(channel, tag, multiple);
            state.nacked += removed as u64;
            removed
        };
        self.notify_if_drained();
        removed
    }

    /// Forgets an entry whose frame never reached the socket.
    pub(crate) fn forget(&self, channel: &str, sequence: u64) {
        self.state.lock().remove(channel, sequence, false);
        self.notify_if_drained();
    }

    fn notify_if_drained(&self) {
        if self.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub fn contains(&self, channel: &str, sequence: u64) -> bool {
        self.state
            .lock()
            .pending
            .get(channel)
            .is_some_and(|p| p.contains(&sequence))
    }

    /// Outstanding sequence numbers of one channel, ascending.
    pub fn pending_for(&self, channel: &str) -> Vec<u64> {
        self.state
            .lock()
            .pending
            .get(channel)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn nacked_count(&self) -> u64 {
        self.state.lock().nacked
    }

    /// Resolves once every tracked publish has been acked or nacked.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }

            notified.await;
        }
    }
}
