use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::incoming::ListenerHandle;
use crate::stack::best_effort;
use crate::{
    EventDispatcher, EventKind, IncomingCallIntent, Profile, ProfileConfig, RegistrationListener,
    RegistrationState, Result, SipError, SipStack, payload,
};

#[derive(Debug)]
enum RegistrationSignal {
    Registering,
    Done { expiry_time: i64 },
    Failed { code: i32, message: String },
}

type TaggedSignal = (u64, RegistrationSignal);

// Listener handed to the stack, one per opened session
struct RegistrationSignals {
    generation: u64,
    signal_tx: mpsc::UnboundedSender<TaggedSignal>,
}

impl RegistrationSignals {
    fn forward(&self, signal: RegistrationSignal) {
        let _ = self.signal_tx.send((self.generation, signal));
    }
}

impl RegistrationListener for RegistrationSignals {
    fn on_registering(&self, _profile_uri: &str) {
        self.forward(RegistrationSignal::Registering);
    }

    fn on_registration_done(&self, _profile_uri: &str, expiry_time: i64) {
        self.forward(RegistrationSignal::Done { expiry_time });
    }

    fn on_registration_failed(&self, _profile_uri: &str, code: i32, message: &str) {
        self.forward(RegistrationSignal::Failed {
            code,
            message: message.to_string(),
        });
    }
}

// Session slot, guarded so commands and stack signals apply one at a time
struct SessionSlot {
    profile: Option<Profile>,
    // Bumped on every open and close; signals from older sessions are stale.
    generation: u64,
}

/// Owns the stack handle and the single registered profile.
pub struct RegistrationManager<S> {
    stack: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    incoming: IncomingCallIntent,
    session: Mutex<SessionSlot>,
    state_tx: watch::Sender<RegistrationState>,
    signal_tx: mpsc::UnboundedSender<TaggedSignal>,
    incoming_listener: OnceCell<ListenerHandle>,
}

impl<S: SipStack + Sync + 'static> RegistrationManager<S> {
    pub fn new(
        stack: Arc<S>,
        dispatcher: Arc<EventDispatcher>,
        incoming: IncomingCallIntent,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RegistrationState::Unregistered);

        let manager = Arc::new(RegistrationManager {
            stack,
            dispatcher,
            incoming,
            session: Mutex::new(SessionSlot {
                profile: None,
                generation: 0,
            }),
            state_tx,
            signal_tx,
            incoming_listener: OnceCell::new(),
        });

        tokio::spawn(Self::run_signal_handler(Arc::downgrade(&manager), signal_rx));
        manager
    }

    /// Validates `config` and opens a stack session for it. Only validation
    /// and a refused open are reported here; the registration outcome
    /// arrives as an event.
    pub async fn register(&self, config: &ProfileConfig) -> Result<()> {
        let profile = Profile::from_config(config)?;
        self.register_profile(profile).await
    }

    /// Opens a session for an already built profile, replacing any session
    /// that is currently open.
    pub async fn register_profile(&self, profile: Profile) -> Result<()> {
        let mut slot = self.session.lock().await;

        if let Some(prior) = slot.profile.take() {
            info!(profile = %prior.uri_string(), "replacing open session");
            best_effort("close prior profile", self.stack.close(&prior.uri_string()).await);
        }
        slot.generation += 1;
        let generation = slot.generation;

        let uri = profile.uri_string();
        debug!(profile = %uri, "opening session");
        if let Err(err) = self.stack.open(&profile, self.incoming.clone()).await {
            self.state_tx.send_replace(RegistrationState::Unregistered);
            return Err(SipError::Registration(err));
        }

        slot.profile = Some(profile);
        self.state_tx.send_replace(RegistrationState::Registering);

        let listener = Arc::new(RegistrationSignals {
            generation,
            signal_tx: self.signal_tx.clone(),
        });
        if let Err(err) = self.stack.set_registration_listener(&uri, listener).await {
            // The session is open, so this is reported like any other failure.
            let _ = self.signal_tx.send((
                generation,
                RegistrationSignal::Failed {
                    code: err.code,
                    message: err.message,
                },
            ));
        }

        Ok(())
    }

    /// Unregisters and releases the session. Never fails; stack errors are
    /// logged.
    pub async fn close(&self) {
        let mut slot = self.session.lock().await;
        slot.generation += 1;

        if let Some(profile) = slot.profile.take() {
            best_effort("close local profile", self.stack.close(&profile.uri_string()).await);
            info!(profile = %profile.uri_string(), "session closed");
        }
        self.state_tx.send_replace(RegistrationState::Unregistered);
    }

    /// Asks the stack whether the active profile is registered. Query
    /// failures read as "not registered".
    pub async fn is_registered(&self) -> bool {
        let Some(uri) = self.profile_uri().await else {
            return false;
        };
        match self.stack.is_registered(&uri).await {
            Ok(registered) => registered,
            Err(err) => {
                debug!(error = %err, "registration query failed");
                false
            }
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state_tx.borrow().clone()
    }

    /// Follows registration state changes.
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.session.lock().await.profile.clone()
    }

    pub async fn profile_uri(&self) -> Option<String> {
        self.session.lock().await.profile.as_ref().map(Profile::uri_string)
    }

    pub fn incoming_action(&self) -> &str {
        self.incoming.action()
    }

    pub(crate) fn stack(&self) -> &Arc<S> {
        &self.stack
    }

    /// Installs the incoming-call listener. Only the first call per manager
    /// has any effect; returns whether this one did.
    pub(crate) fn install_incoming_listener(
        &self,
        spawn: impl FnOnce() -> ListenerHandle,
    ) -> bool {
        let mut installed = false;
        self.incoming_listener.get_or_init(|| {
            installed = true;
            spawn()
        });
        installed
    }

    async fn run_signal_handler(
        manager: Weak<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<TaggedSignal>,
    ) {
        while let Some((generation, signal)) = signal_rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            manager.handle_signal(generation, signal).await;
        }
    }

    async fn handle_signal(&self, generation: u64, signal: RegistrationSignal) {
        let slot = self.session.lock().await;
        if slot.generation != generation || slot.profile.is_none() {
            debug!(?signal, "stale registration signal dropped");
            return;
        }

        match signal {
            RegistrationSignal::Registering => {
                self.state_tx.send_replace(RegistrationState::Registering);
                self.dispatcher.fire(EventKind::Registering);
                debug!("registering with SIP server");
            }
            RegistrationSignal::Done { expiry_time } => {
                self.state_tx.send_replace(RegistrationState::Registered);
                self.dispatcher.fire_with(
                    EventKind::RegistrationDone,
                    payload! { "expiryTime" => expiry_time },
                );
                info!(expiry_time, "registered");
            }
            RegistrationSignal::Failed { code, message } => {
                warn!(code, %message, "registration failed");
                self.dispatcher.fire_with(
                    EventKind::RegistrationFailed,
                    payload! { "code" => code, "message" => message.as_str() },
                );
                self.state_tx
                    .send_replace(RegistrationState::Failed { code, message });
            }
        }
    }
}
