//! Multi-session broadcast registry.
//!
//! A [`Channel`] groups live sessions so one logical event can be fanned out
//! to all of them. Membership tracks session lifecycles: every member is
//! connected, and a member that disconnects is removed by the channel itself
//! through a per-member watcher on the session's lifecycle notifications —
//! no caller action required.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::SseError;
use crate::protocol::SseEvent;
use crate::session::{Session, SessionId, SessionStatus};

/// A registered session plus the watcher task that auto-removes it on
/// disconnect.
struct Member<S> {
    session: Arc<Session<S>>,
    watcher: JoinHandle<()>,
}

/// Options for a single broadcast call.
pub struct BroadcastOptions<'a, S> {
    /// Predicate over candidate sessions (and, through them, their state
    /// bags); only matching sessions receive the event.
    pub filter: Option<&'a (dyn Fn(&Session<S>) -> bool + Send + Sync)>,
    /// Session to skip, commonly the one that triggered the broadcast.
    pub exclude: Option<SessionId>,
}

impl<S> Default for BroadcastOptions<'_, S> {
    fn default() -> Self {
        Self {
            filter: None,
            exclude: None,
        }
    }
}

impl<S> fmt::Debug for BroadcastOptions<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("filter", &self.filter.map(|_| "<predicate>"))
            .field("exclude", &self.exclude)
            .finish()
    }
}

/// A group of sessions addressed together for broadcast.
///
/// Channels own no process-wide state: create as many as needed and drop
/// them freely. Constructed behind an [`Arc`] so the per-member watcher
/// tasks can hold a weak backreference for auto-removal.
pub struct Channel<S = serde_json::Value> {
    members: RwLock<HashMap<SessionId, Member<S>>>,
}

impl<S> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> Channel<S> {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(HashMap::new()),
        })
    }

    /// Adds a connected session to the channel and subscribes to its
    /// lifecycle so it is removed automatically on disconnect.
    /// Re-registering an already-registered session is a no-op.
    ///
    /// Auto-removal runs on the watcher task, one scheduler hop after the
    /// session publishes `Disconnected`, so [`Channel::session_count`] may
    /// briefly still include a just-disconnected member.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Registration`] if the session is not connected.
    pub async fn register(self: &Arc<Self>, session: Arc<Session<S>>) -> Result<(), SseError> {
        if !session.is_connected() {
            return Err(SseError::Registration(session.id()));
        }
        let id = session.id();
        let mut members = self.members.write().await;
        if members.contains_key(&id) {
            return Ok(());
        }
        let watcher = self.spawn_removal_watcher(&session);
        members.insert(id, Member { session, watcher });
        tracing::debug!(session = %id, "session registered");
        Ok(())
    }

    /// Removes a session from the channel, returning whether it was
    /// present. Never errors on an absent session.
    pub async fn deregister(&self, id: &SessionId) -> bool {
        let removed = self.members.write().await.remove(id);
        match removed {
            Some(member) => {
                member.watcher.abort();
                tracing::debug!(session = %id, "session deregistered");
                true
            }
            None => false,
        }
    }

    /// Fans one event out to every registered, filter-matching session,
    /// skipping `exclude`. Because auto-removal lags the disconnect by a
    /// scheduler hop, the snapshot can still contain a just-disconnected
    /// member; its delivery failure is isolated per recipient and logged,
    /// never propagated.
    ///
    /// Returns the number of sessions the event was delivered to. Delivery
    /// order over members is unspecified.
    pub async fn broadcast(&self, event: SseEvent, options: &BroadcastOptions<'_, S>) -> usize {
        // Snapshot the membership so session_count stays readable (and
        // auto-removal can run) while deliveries are in flight.
        let mut recipients: Vec<Arc<Session<S>>> = Vec::new();
        {
            let members = self.members.read().await;
            recipients.reserve(members.len());
            for member in members.values() {
                if options.exclude == Some(member.session.id()) {
                    continue;
                }
                recipients.push(Arc::clone(&member.session));
            }
        }

        let mut delivered = 0;
        for session in recipients {
            if let Some(filter) = options.filter
                && !filter(&session)
            {
                continue;
            }
            match session.push(event.clone()).await {
                Ok(_) => delivered += 1,
                Err(err) => {
                    tracing::debug!(session = %session.id(), %err, "broadcast delivery skipped");
                }
            }
        }
        delivered
    }

    /// Current number of live members. Never cached: reflects auto-removals
    /// immediately and is safe to read during an in-progress broadcast.
    pub async fn session_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Returns `true` if the channel has no members.
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Snapshot of the current member ids.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.members.read().await.keys().copied().collect()
    }

    /// Waits on the session's lifecycle watch and deregisters it when it
    /// disconnects (or is dropped). One watcher per member, aborted on
    /// explicit deregistration.
    fn spawn_removal_watcher(self: &Arc<Self>, session: &Arc<Session<S>>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let id = session.id();
        let mut status = session.status_changes();
        tokio::spawn(async move {
            let _ = status
                .wait_for(|status| *status == SessionStatus::Disconnected)
                .await;
            if let Some(channel) = weak.upgrade() {
                channel.deregister(&id).await;
            }
        })
    }
}
