// Application-facing client: one registration, one call, one event stream
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::incoming::IncomingCallListener;
use crate::{
    CallSession, CallState, ErrorEventPolicy, Event, EventDispatcher, EventKind,
    IncomingCallChannel, Profile, ProfileConfig, RegistrationManager, RegistrationState, Result,
    SipStack, SourceId,
};

pub const DEFAULT_SOURCE: &str = "sip-client";

/// Command surface for the embedding application.
///
/// Only [`register`](SipClient::register) reports failure directly. Every
/// other command is a guarded no-op when it does not apply, and outcomes
/// arrive as events through the callbacks registered with [`on`](SipClient::on).
pub struct SipClient<S> {
    source: SourceId,
    dispatcher: Arc<EventDispatcher>,
    registration: Arc<RegistrationManager<S>>,
    session: Arc<CallSession<S>>,
}

pub struct SipClientBuilder<S> {
    stack: Arc<S>,
    source: String,
    incoming_channel: Option<IncomingCallChannel>,
    incoming_action: Option<String>,
    error_events: ErrorEventPolicy,
}

impl<S: SipStack + Sync + 'static> SipClientBuilder<S> {
    pub fn new(stack: Arc<S>) -> Self {
        SipClientBuilder {
            stack,
            source: DEFAULT_SOURCE.to_string(),
            incoming_channel: None,
            incoming_action: None,
            error_events: ErrorEventPolicy::default(),
        }
    }

    /// Name reported as `source` in every event payload.
    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Shares a platform notification channel with other clients.
    pub fn incoming_channel(mut self, channel: IncomingCallChannel) -> Self {
        self.incoming_channel = Some(channel);
        self
    }

    /// Private action incoming calls for this client are announced under.
    pub fn incoming_action(mut self, action: &str) -> Self {
        self.incoming_action = Some(action.to_string());
        self
    }

    pub fn error_events(mut self, policy: ErrorEventPolicy) -> Self {
        self.error_events = policy;
        self
    }

    /// Wires the components together. Must run inside a tokio runtime.
    pub fn build(self) -> Arc<SipClient<S>> {
        let channel = self.incoming_channel.unwrap_or_default();
        let action = self
            .incoming_action
            .unwrap_or_else(|| format!("{}.INCOMING_CALL", self.source));

        let source = SourceId(self.source);
        let dispatcher = EventDispatcher::new(source.clone());
        let registration = RegistrationManager::new(
            self.stack,
            dispatcher.clone(),
            channel.intent(action.clone()),
        );
        let session = CallSession::new(registration.clone(), dispatcher.clone(), self.error_events);

        let weak_session = Arc::downgrade(&session);
        registration.install_incoming_listener(|| {
            IncomingCallListener::spawn(weak_session, channel.subscribe(), action)
        });

        info!(%source, "SIP client ready");
        Arc::new(SipClient {
            source,
            dispatcher,
            registration,
            session,
        })
    }
}

impl<S: SipStack + Sync + 'static> SipClient<S> {
    pub fn builder(stack: Arc<S>) -> SipClientBuilder<S> {
        SipClientBuilder::new(stack)
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, callback);
    }

    pub fn on_async<F, Fut>(&self, kind: EventKind, callback: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.on_async(kind, callback);
    }

    pub fn off(&self, kind: EventKind) -> bool {
        self.dispatcher.off(kind)
    }

    pub async fn register(&self, config: &ProfileConfig) -> Result<()> {
        self.registration.register(config).await
    }

    /// Ends any live call, then unregisters and releases the profile.
    pub async fn close(&self) {
        self.session.hangup().await;
        self.registration.close().await;
    }

    pub async fn answer(&self) {
        self.session.answer().await;
    }

    pub async fn hangup(&self) {
        self.session.hangup().await;
    }

    pub async fn hold_call(&self) {
        self.session.hold().await;
    }

    pub async fn unhold_call(&self) {
        self.session.unhold().await;
    }

    pub async fn toggle_muted(&self) {
        self.session.toggle_muted().await;
    }

    pub async fn set_speaker_mode(&self, on: bool) {
        self.session.set_speaker_mode(on).await;
    }

    pub async fn send_dtmf(&self, code: u8) {
        self.session.send_dtmf(code).await;
    }

    pub async fn initiate_call(&self, address: &str) {
        self.session.initiate(address).await;
    }

    pub async fn is_in_call(&self) -> bool {
        self.session.is_in_call().await
    }

    pub async fn is_muted(&self) -> bool {
        self.session.is_muted().await
    }

    pub async fn is_on_hold(&self) -> bool {
        self.session.is_on_hold().await
    }

    pub async fn is_registered(&self) -> bool {
        self.registration.is_registered().await
    }

    pub async fn call_state(&self) -> CallState {
        self.session.state().await
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn watch_registration(&self) -> watch::Receiver<RegistrationState> {
        self.registration.subscribe()
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.registration.profile().await
    }

    pub fn incoming_action(&self) -> &str {
        self.registration.incoming_action()
    }
}
