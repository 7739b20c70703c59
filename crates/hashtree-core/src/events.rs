//! Change notifications for subscribers outside the core
//!
//! Each logical channel is a tokio broadcast channel. Publishing never
//! blocks and never fails when nobody listens; slow subscribers see
//! `RecvError::Lagged` and skip ahead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::fallback::MirrorEvent;
use crate::types::Cid;

/// Logical notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A writer produced a new root
    RootChanged,
    /// The search index gained or replaced entries
    IndexUpdated,
    /// Background mirror progress
    Mirror,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::RootChanged, Channel::IndexUpdated, Channel::Mirror];
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    RootChanged { root: Cid, previous: Option<Cid> },
    /// `root` is None for entries merged from a snapshot
    IndexUpdated { root: Option<Cid>, entries: usize },
    Mirror(MirrorEvent),
}

impl Notification {
    pub fn channel(&self) -> Channel {
        match self {
            Notification::RootChanged { .. } => Channel::RootChanged,
            Notification::IndexUpdated { .. } => Channel::IndexUpdated,
            Notification::Mirror(_) => Channel::Mirror,
        }
    }
}

/// Fan-out point for notifications, cheap to clone
#[derive(Debug, Clone)]
pub struct Notifier {
    senders: Arc<HashMap<Channel, broadcast::Sender<Notification>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` is the per-channel backlog kept for slow subscribers
    pub fn with_capacity(capacity: usize) -> Self {
        let senders = Channel::ALL
            .iter()
            .map(|channel| (*channel, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self {
            senders: Arc::new(senders),
        }
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        match self.senders.get(&channel) {
            Some(sender) => sender.subscribe(),
            // every channel is created up front
            None => broadcast::channel(1).1,
        }
    }

    /// Publish; returns how many subscribers received it
    pub fn notify(&self, notification: Notification) -> usize {
        self.senders
            .get(&notification.channel())
            .and_then(|sender| sender.send(notification).ok())
            .unwrap_or(0)
    }

    /// Re-publish mirror events on [`Channel::Mirror`] until the source closes
    pub fn forward_mirror(&self, mut events: broadcast::Receiver<MirrorEvent>) -> tokio::task::JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        notifier.notify(Notification::Mirror(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "mirror event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
