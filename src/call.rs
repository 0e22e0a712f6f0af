use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::stack::best_effort;
use crate::{
    AudioCall, CallListener, CallState, EventDispatcher, EventKind, IncomingCallPayload,
    PeerProfile, RegistrationManager, STACK_OPERATION_TIMEOUT, SipError, SipStack, SipUri,
    StackResult, payload,
};

/// Highest DTMF code the stack accepts (0-9, `*`, `#`, A-D).
pub const MAX_DTMF_CODE: u8 = 15;

/// How stack errors on a call reach the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorEventPolicy {
    /// Stack errors fire ON_ERROR; ON_CALL_BUSY is reserved for busy signals.
    #[default]
    Split,
    /// Stack errors fire ON_CALL_BUSY with the error payload, for consumers
    /// written against bridges that never emitted ON_ERROR.
    MergeIntoBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Snapshot of the current call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub state: CallState,
    pub direction: CallDirection,
    pub muted: bool,
    pub speaker_on: bool,
    pub peer_uri: String,
    pub peer_display_name: Option<String>,
}

impl CallInfo {
    fn new(direction: CallDirection, state: CallState, peer: PeerProfile) -> Self {
        CallInfo {
            state,
            direction,
            muted: false,
            speaker_on: false,
            peer_uri: peer.uri,
            peer_display_name: peer.display_name,
        }
    }
}

#[derive(Debug)]
enum CallSignal {
    Ringing,
    RingingBack,
    Established,
    Busy,
    Error { code: i32, message: String },
    Ended,
}

type TaggedSignal = (u64, CallSignal);

// Listener handed to the stack, one per call
struct CallSignals {
    generation: u64,
    signal_tx: mpsc::UnboundedSender<TaggedSignal>,
}

impl CallSignals {
    fn forward(&self, signal: CallSignal) {
        let _ = self.signal_tx.send((self.generation, signal));
    }
}

impl CallListener for CallSignals {
    fn on_ringing(&self, _caller: &PeerProfile) {
        self.forward(CallSignal::Ringing);
    }

    fn on_ringing_back(&self) {
        self.forward(CallSignal::RingingBack);
    }

    fn on_call_established(&self) {
        self.forward(CallSignal::Established);
    }

    fn on_call_busy(&self) {
        self.forward(CallSignal::Busy);
    }

    fn on_error(&self, code: i32, message: &str) {
        self.forward(CallSignal::Error {
            code,
            message: message.to_string(),
        });
    }

    fn on_call_ended(&self) {
        self.forward(CallSignal::Ended);
    }
}

struct ActiveCall {
    generation: u64,
    // None once released back to the stack.
    handle: Option<Box<dyn AudioCall>>,
    info: CallInfo,
}

impl ActiveCall {
    fn parts(&mut self) -> Option<(&mut CallInfo, &dyn AudioCall)> {
        let handle = self.handle.as_deref()?;
        Some((&mut self.info, handle))
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

struct CallSlot {
    call: Option<ActiveCall>,
    generation: u64,
}

impl CallSlot {
    fn live(&self) -> Option<&ActiveCall> {
        self.call.as_ref().filter(|call| call.info.state.is_live())
    }

    /// The call record and handle, if a call exists in a state `accept` allows.
    fn call_in(
        &mut self,
        accept: impl Fn(&CallState) -> bool,
    ) -> Option<(&mut CallInfo, &dyn AudioCall)> {
        self.call
            .as_mut()
            .filter(|call| accept(&call.info.state))
            .and_then(ActiveCall::parts)
    }

    /// Drops a finished record before a new call takes the slot.
    fn clear_finished(&mut self) {
        if let Some(mut prior) = self.call.take() {
            prior.release();
        }
    }
}

/// Owns the single active call and drives its state machine.
///
/// Control operations are guarded no-ops when there is no call or the call
/// is in a state where the operation means nothing. Stack signals and
/// commands serialize on one lock, so concurrent arrivals settle on a single
/// final state.
pub struct CallSession<S> {
    registration: Arc<RegistrationManager<S>>,
    dispatcher: Arc<EventDispatcher>,
    error_policy: ErrorEventPolicy,
    slot: Mutex<CallSlot>,
    signal_tx: mpsc::UnboundedSender<TaggedSignal>,
}

impl<S: SipStack + Sync + 'static> CallSession<S> {
    pub fn new(
        registration: Arc<RegistrationManager<S>>,
        dispatcher: Arc<EventDispatcher>,
        error_policy: ErrorEventPolicy,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let session = Arc::new(CallSession {
            registration,
            dispatcher,
            error_policy,
            slot: Mutex::new(CallSlot {
                call: None,
                generation: 0,
            }),
            signal_tx,
        });

        tokio::spawn(Self::run_signal_handler(Arc::downgrade(&session), signal_rx));
        session
    }

    /// Places an outbound call to `address` from the registered profile.
    ///
    /// If the stack cannot open the call, the registration session is closed
    /// and the session stays idle. Nothing is reported to the application for
    /// that cleanup; the failure is logged.
    pub async fn initiate(&self, address: &str) {
        let address = address.trim();
        if let Err(err) = SipUri::parse(address) {
            warn!(%address, error = %err, "not dialing invalid address");
            return;
        }

        let mut slot = self.slot.lock().await;
        if let Some(call) = slot.live() {
            warn!(state = ?call.info.state, "call in progress, not dialing");
            return;
        }
        let Some(profile_uri) = self.registration.profile_uri().await else {
            warn!("no open profile, not dialing");
            return;
        };

        let (generation, listener) = self.next_listener(&mut slot);
        let result = self
            .registration
            .stack()
            .make_audio_call(&profile_uri, address, listener, STACK_OPERATION_TIMEOUT)
            .await;

        match result {
            Ok(handle) => {
                slot.clear_finished();
                slot.call = Some(ActiveCall {
                    generation,
                    handle: Some(handle),
                    info: CallInfo::new(
                        CallDirection::Outgoing,
                        CallState::Dialing,
                        PeerProfile::new(None, address),
                    ),
                });
                info!(peer = %address, "dialing");
            }
            Err(err) => {
                let err = SipError::CallSetup(err);
                warn!(peer = %address, error = %err, "could not place call, closing session");
                self.registration.close().await;
                slot.clear_finished();
            }
        }
    }

    /// Claims an announced incoming call and puts it in the ringing state.
    /// The call answers itself as soon as the stack reports it ringing.
    pub(crate) async fn claim_incoming(&self, incoming: &IncomingCallPayload) {
        let mut slot = self.slot.lock().await;
        if let Some(call) = slot.live() {
            warn!(
                call_id = %incoming.call_id,
                state = ?call.info.state,
                "call in progress, incoming call left unclaimed"
            );
            return;
        }

        let (generation, listener) = self.next_listener(&mut slot);
        let handle = match self
            .registration
            .stack()
            .take_audio_call(incoming, listener)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(call_id = %incoming.call_id, error = %err, "could not claim incoming call");
                return;
            }
        };

        let peer = match self.attach(&mut slot, generation, handle) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(call_id = %incoming.call_id, error = %err, "incoming call dropped");
                return;
            }
        };

        info!(peer = %peer.uri, "incoming call");
        self.dispatcher.fire_with(
            EventKind::IncomingCall,
            payload! { "displayName" => peer.display_name, "uri" => peer.uri },
        );
    }

    /// Idle -> Ringing. On failure the claimed handle is closed.
    fn attach(
        &self,
        slot: &mut CallSlot,
        generation: u64,
        handle: Box<dyn AudioCall>,
    ) -> StackResult<PeerProfile> {
        let peer = match handle.peer_profile() {
            Ok(peer) => peer,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };

        slot.clear_finished();
        slot.call = Some(ActiveCall {
            generation,
            handle: Some(handle),
            info: CallInfo::new(CallDirection::Incoming, CallState::Ringing, peer.clone()),
        });
        Ok(peer)
    }

    pub async fn answer(&self) {
        let mut slot = self.slot.lock().await;
        match slot.call_in(|state| *state == CallState::Ringing) {
            Some((info, handle)) => self.answer_ringing(info, handle),
            None => debug!("answer ignored, no ringing call"),
        }
    }

    pub async fn hangup(&self) {
        let mut slot = self.slot.lock().await;
        let Some(mut call) = slot.call.take_if(|call| call.info.state.is_live()) else {
            debug!("hangup ignored, no live call");
            return;
        };

        if let Some(handle) = call.handle.as_deref() {
            best_effort("end call", handle.end_call());
        }
        self.dispatcher.fire(EventKind::CallEnded);
        call.release();
        info!(peer = %call.info.peer_uri, "call hung up");
    }

    pub async fn hold(&self) {
        let mut slot = self.slot.lock().await;
        let Some((info, handle)) = slot.call_in(|state| *state == CallState::Established) else {
            debug!("hold ignored, no established call");
            return;
        };
        match handle.hold_call(STACK_OPERATION_TIMEOUT) {
            Ok(()) => info.state = CallState::OnHold,
            Err(err) => warn!(error = %err, "hold failed"),
        }
    }

    pub async fn unhold(&self) {
        let mut slot = self.slot.lock().await;
        let Some((info, handle)) = slot.call_in(|state| *state == CallState::OnHold) else {
            debug!("unhold ignored, call not on hold");
            return;
        };
        match handle.continue_call(STACK_OPERATION_TIMEOUT) {
            Ok(()) => info.state = CallState::Established,
            Err(err) => warn!(error = %err, "unhold failed"),
        }
    }

    pub async fn toggle_muted(&self) {
        let mut slot = self.slot.lock().await;
        if let Some((info, handle)) = slot.call_in(CallState::is_live) {
            handle.toggle_mute();
            info.muted = handle.is_muted();
        }
    }

    pub async fn set_speaker_mode(&self, on: bool) {
        let mut slot = self.slot.lock().await;
        if let Some((info, handle)) = slot.call_in(CallState::is_live) {
            handle.set_speaker_mode(on);
            info.speaker_on = on;
        }
    }

    pub async fn send_dtmf(&self, code: u8) {
        if code > MAX_DTMF_CODE {
            warn!(code, "not a DTMF code");
            return;
        }
        let mut slot = self.slot.lock().await;
        if let Some((_, handle)) = slot.call_in(CallState::is_connected) {
            handle.send_dtmf(code);
        }
    }

    pub async fn is_in_call(&self) -> bool {
        self.state().await.is_connected()
    }

    pub async fn is_muted(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.live().is_some_and(|call| call.info.muted)
    }

    pub async fn is_on_hold(&self) -> bool {
        self.state().await == CallState::OnHold
    }

    pub async fn state(&self) -> CallState {
        let slot = self.slot.lock().await;
        slot.call
            .as_ref()
            .map_or(CallState::Idle, |call| call.info.state.clone())
    }

    pub async fn info(&self) -> Option<CallInfo> {
        let slot = self.slot.lock().await;
        slot.call.as_ref().map(|call| call.info.clone())
    }

    fn next_listener(&self, slot: &mut CallSlot) -> (u64, Arc<dyn CallListener>) {
        slot.generation += 1;
        let listener: Arc<dyn CallListener> = Arc::new(CallSignals {
            generation: slot.generation,
            signal_tx: self.signal_tx.clone(),
        });
        (slot.generation, listener)
    }

    fn answer_ringing(&self, info: &mut CallInfo, handle: &dyn AudioCall) {
        if let Err(err) = handle.answer_call(STACK_OPERATION_TIMEOUT) {
            warn!(error = %err, "answer failed");
            return;
        }
        self.establish(info, handle);
    }

    // Established calls always start unmuted with the speaker on.
    fn establish(&self, info: &mut CallInfo, handle: &dyn AudioCall) {
        handle.start_audio();
        handle.set_speaker_mode(true);
        if handle.is_muted() {
            handle.toggle_mute();
        }

        info.state = CallState::Established;
        info.muted = false;
        info.speaker_on = true;
        info!(peer = %info.peer_uri, "call established");
        self.dispatcher.fire(EventKind::CallEstablished);
    }

    async fn run_signal_handler(
        session: Weak<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<TaggedSignal>,
    ) {
        while let Some((generation, signal)) = signal_rx.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.handle_signal(generation, signal).await;
        }
    }

    async fn handle_signal(&self, generation: u64, signal: CallSignal) {
        let mut slot = self.slot.lock().await;
        let Some(call) = slot
            .call
            .as_mut()
            .filter(|call| call.generation == generation && call.info.state.is_live())
        else {
            debug!(?signal, "signal for stale or finished call dropped");
            return;
        };

        let direction = call.info.direction;
        let mut finished = false;
        let Some((info, handle)) = call.parts() else {
            return;
        };

        match signal {
            CallSignal::Ringing => {
                if direction == CallDirection::Incoming && info.state == CallState::Ringing {
                    debug!("auto-answering incoming call");
                    self.answer_ringing(info, handle);
                }
            }
            CallSignal::RingingBack => {
                if info.state.is_dialing() {
                    info.state = CallState::RingingBack;
                    self.dispatcher.fire(EventKind::RingingBack);
                    debug!("ringing back");
                }
            }
            CallSignal::Established => {
                if info.state.is_dialing() || info.state == CallState::Ringing {
                    self.establish(info, handle);
                }
            }
            CallSignal::Busy => {
                if info.state.is_dialing() {
                    info.state = CallState::Ended;
                    self.dispatcher.fire(EventKind::CallBusy);
                    info!(peer = %info.peer_uri, "peer busy");
                    finished = true;
                }
            }
            CallSignal::Error { code, message } => {
                warn!(code, %message, "call error");
                let kind = match self.error_policy {
                    ErrorEventPolicy::Split => EventKind::Error,
                    ErrorEventPolicy::MergeIntoBusy => EventKind::CallBusy,
                };
                self.dispatcher.fire_with(
                    kind,
                    payload! { "errorCode" => code, "errorMessage" => message.as_str() },
                );
                info.state = CallState::Error { code, message };
                finished = true;
            }
            CallSignal::Ended => {
                info.state = CallState::Ended;
                self.dispatcher.fire(EventKind::CallEnded);
                info!(peer = %info.peer_uri, "call ended by peer");
                slot.clear_finished();
                return;
            }
        }

        if finished {
            call.release();
        }
    }
}
