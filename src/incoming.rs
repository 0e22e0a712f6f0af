// Inbound call notifications
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{CallSession, SipStack};

const CHANNEL_CAPACITY: usize = 64;

/// What the platform hands over when the stack announces an incoming call.
/// Opaque to us; the stack uses it to find the call again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallPayload {
    pub call_id: String,
    pub extras: BTreeMap<String, String>,
}

impl IncomingCallPayload {
    pub fn new(call_id: impl Into<String>) -> Self {
        IncomingCallPayload {
            call_id: call_id.into(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct IncomingCallNotification {
    pub action: String,
    pub payload: IncomingCallPayload,
}

/// Platform-wide broadcast channel for incoming-call notifications. Several
/// clients may share one; each only reacts to its own private action.
#[derive(Clone)]
pub struct IncomingCallChannel {
    tx: broadcast::Sender<IncomingCallNotification>,
}

impl IncomingCallChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        IncomingCallChannel { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncomingCallNotification> {
        self.tx.subscribe()
    }

    /// Handle the stack fires to announce calls under `action`.
    pub fn intent(&self, action: impl Into<String>) -> IncomingCallIntent {
        IncomingCallIntent {
            action: action.into(),
            channel: self.clone(),
        }
    }

    /// Returns false when nobody is subscribed.
    pub fn broadcast(&self, notification: IncomingCallNotification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

impl Default for IncomingCallChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IncomingCallChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCallChannel")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Pending notification given to the stack when a profile is opened.
#[derive(Clone, Debug)]
pub struct IncomingCallIntent {
    action: String,
    channel: IncomingCallChannel,
}

impl IncomingCallIntent {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn deliver(&self, payload: IncomingCallPayload) -> bool {
        self.channel.broadcast(IncomingCallNotification {
            action: self.action.clone(),
            payload,
        })
    }
}

/// Aborts the listener task when the owning registration manager goes away.
pub(crate) struct ListenerHandle(JoinHandle<()>);

impl ListenerHandle {
    #[cfg(test)]
    pub(crate) fn idle() -> Self {
        ListenerHandle(tokio::spawn(async {}))
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background receiver that turns notifications for `action` into claimed
/// calls on the session.
pub(crate) struct IncomingCallListener;

impl IncomingCallListener {
    pub(crate) fn spawn<S>(
        session: Weak<CallSession<S>>,
        mut notifications: broadcast::Receiver<IncomingCallNotification>,
        action: String,
    ) -> ListenerHandle
    where
        S: SipStack + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) if notification.action == action => {
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        debug!(call_id = %notification.payload.call_id, "incoming call notification");
                        session.claim_incoming(&notification.payload).await;
                    }
                    Ok(notification) => {
                        debug!(action = %notification.action, "notification for another action ignored");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "incoming call notifications dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        ListenerHandle(task)
    }
}
