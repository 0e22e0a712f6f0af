//! Seam to the underlying SIP stack.
//!
//! The stack performs registration handshakes, transactions and media
//! negotiation. This crate only drives it: commands go down through
//! [`SipStack`] and [`AudioCall`], and outcomes come back asynchronously
//! through the listener traits, on whatever thread the stack uses.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::{IncomingCallIntent, IncomingCallPayload, Profile, StackResult};

/// Identity of the remote party of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub display_name: Option<String>,
    pub uri: String,
}

impl PeerProfile {
    pub fn new(display_name: Option<&str>, uri: impl Into<String>) -> Self {
        PeerProfile {
            display_name: display_name.map(str::to_string),
            uri: uri.into(),
        }
    }
}

/// Registration outcomes signalled by the stack for one profile URI.
pub trait RegistrationListener: Send + Sync {
    fn on_registering(&self, _profile_uri: &str) {}
    fn on_registration_done(&self, _profile_uri: &str, _expiry_time: i64) {}
    fn on_registration_failed(&self, _profile_uri: &str, _code: i32, _message: &str) {}
}

/// Call progress signalled by the stack for one call.
pub trait CallListener: Send + Sync {
    fn on_ringing(&self, _caller: &PeerProfile) {}
    fn on_ringing_back(&self) {}
    fn on_call_established(&self) {}
    fn on_call_busy(&self) {}
    fn on_error(&self, _code: i32, _message: &str) {}
    fn on_call_ended(&self) {}
}

/// Handle to one audio call inside the stack. Commands are non-blocking;
/// their outcome arrives through the call's [`CallListener`].
pub trait AudioCall: Send + Sync {
    fn answer_call(&self, timeout: Duration) -> StackResult<()>;
    fn start_audio(&self);
    fn set_speaker_mode(&self, on: bool);
    fn is_muted(&self) -> bool;
    fn toggle_mute(&self);
    fn hold_call(&self, timeout: Duration) -> StackResult<()>;
    fn continue_call(&self, timeout: Duration) -> StackResult<()>;
    fn send_dtmf(&self, code: u8);
    fn end_call(&self) -> StackResult<()>;
    /// Releases the handle. Safe to call more than once.
    fn close(&self);
    fn peer_profile(&self) -> StackResult<PeerProfile>;
}

/// Session-level capability of the stack.
#[trait_variant::make(SipStack: Send)]
pub trait LocalSipStack {
    /// Opens a session for `profile`. Incoming calls for it are announced
    /// through `incoming`.
    async fn open(&self, profile: &Profile, incoming: IncomingCallIntent) -> StackResult<()>;

    async fn set_registration_listener(
        &self,
        profile_uri: &str,
        listener: Arc<dyn RegistrationListener>,
    ) -> StackResult<()>;

    async fn close(&self, profile_uri: &str) -> StackResult<()>;

    async fn is_registered(&self, profile_uri: &str) -> StackResult<bool>;

    async fn make_audio_call(
        &self,
        profile_uri: &str,
        peer_uri: &str,
        listener: Arc<dyn CallListener>,
        timeout: Duration,
    ) -> StackResult<Box<dyn AudioCall>>;

    /// Claims the call announced by an incoming-call notification.
    async fn take_audio_call(
        &self,
        incoming: &IncomingCallPayload,
        listener: Arc<dyn CallListener>,
    ) -> StackResult<Box<dyn AudioCall>>;
}

/// Cleanup policy: failures are logged and otherwise ignored, the caller
/// cannot act on them.
pub(crate) fn best_effort(what: &str, result: StackResult<()>) {
    if let Err(err) = result {
        warn!(error = %err, "{} failed, continuing", what);
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory stack. Records every command and lets tests play
    //! the part of the stack's signal threads.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{AudioCall, CallListener, PeerProfile, RegistrationListener, SipStack};
    use crate::{IncomingCallIntent, IncomingCallPayload, Profile, StackError, StackResult};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StackOp {
        Open(String),
        SetRegistrationListener(String),
        Close(String),
        IsRegistered(String),
        MakeCall { from: String, to: String },
        TakeCall(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CallOp {
        Answer(Duration),
        StartAudio,
        Speaker(bool),
        ToggleMute,
        Hold(Duration),
        Continue(Duration),
        Dtmf(u8),
        End,
        Close,
    }

    #[derive(Default)]
    pub struct Failures {
        pub open: bool,
        pub close: bool,
        pub is_registered: bool,
        pub make_call: bool,
        pub take_call: bool,
        pub peer_profile: bool,
        pub answer: bool,
    }

    #[derive(Default)]
    struct State {
        ops: Vec<StackOp>,
        registration_listeners: HashMap<String, Arc<dyn RegistrationListener>>,
        call_listeners: Vec<Arc<dyn CallListener>>,
        calls: Vec<Arc<MockCallState>>,
        intent: Option<IncomingCallIntent>,
        registered: bool,
        incoming_peer: Option<PeerProfile>,
        start_muted: bool,
    }

    #[derive(Default)]
    pub struct MockStack {
        state: Mutex<State>,
        pub failures: Mutex<Failures>,
    }

    impl MockStack {
        pub fn new() -> Arc<Self> {
            Arc::new(MockStack::default())
        }

        pub fn ops(&self) -> Vec<StackOp> {
            self.state.lock().unwrap().ops.clone()
        }

        pub fn count_ops(&self, pred: impl Fn(&StackOp) -> bool) -> usize {
            self.ops().iter().filter(|op| pred(op)).count()
        }

        pub fn fail(&self, f: impl FnOnce(&mut Failures)) {
            f(&mut self.failures.lock().unwrap());
        }

        pub fn set_registered(&self, registered: bool) {
            self.state.lock().unwrap().registered = registered;
        }

        pub fn set_incoming_peer(&self, peer: PeerProfile) {
            self.state.lock().unwrap().incoming_peer = Some(peer);
        }

        /// New calls report muted until toggled.
        pub fn start_calls_muted(&self) {
            self.state.lock().unwrap().start_muted = true;
        }

        pub fn registration_listener(&self, uri: &str) -> Arc<dyn RegistrationListener> {
            self.state.lock().unwrap().registration_listeners[uri].clone()
        }

        pub fn call_listener(&self) -> Arc<dyn CallListener> {
            self.state
                .lock()
                .unwrap()
                .call_listeners
                .last()
                .cloned()
                .expect("no call listener installed")
        }

        pub fn call(&self) -> Arc<MockCallState> {
            self.state
                .lock()
                .unwrap()
                .calls
                .last()
                .cloned()
                .expect("no call created")
        }

        pub fn call_count(&self) -> usize {
            self.state.lock().unwrap().calls.len()
        }

        /// Plays the platform broadcasting an incoming call for the opened profile.
        pub fn ring(&self, call_id: &str) -> bool {
            let intent = self.state.lock().unwrap().intent.clone();
            intent.is_some_and(|intent| intent.deliver(IncomingCallPayload::new(call_id)))
        }

        fn record(&self, op: StackOp) {
            self.state.lock().unwrap().ops.push(op);
        }

        fn new_call(&self, listener: Arc<dyn CallListener>) -> Box<dyn AudioCall> {
            let (fail_answer, fail_peer) = {
                let failures = self.failures.lock().unwrap();
                (failures.answer, failures.peer_profile)
            };
            let mut state = self.state.lock().unwrap();
            let call = Arc::new(MockCallState {
                muted: AtomicBool::new(state.start_muted),
                fail_answer,
                fail_peer,
                peer: state
                    .incoming_peer
                    .clone()
                    .unwrap_or_else(|| PeerProfile::new(None, "sip:unknown@invalid")),
                ..Default::default()
            });
            state.calls.push(call.clone());
            state.call_listeners.push(listener);
            Box::new(MockCall(call))
        }
    }

    impl SipStack for MockStack {
        async fn open(&self, profile: &Profile, incoming: IncomingCallIntent) -> StackResult<()> {
            self.record(StackOp::Open(profile.uri_string()));
            if self.failures.lock().unwrap().open {
                return Err(StackError::new(-9, "open refused"));
            }
            self.state.lock().unwrap().intent = Some(incoming);
            Ok(())
        }

        async fn set_registration_listener(
            &self,
            profile_uri: &str,
            listener: Arc<dyn RegistrationListener>,
        ) -> StackResult<()> {
            self.record(StackOp::SetRegistrationListener(profile_uri.to_string()));
            self.state
                .lock()
                .unwrap()
                .registration_listeners
                .insert(profile_uri.to_string(), listener);
            Ok(())
        }

        async fn close(&self, profile_uri: &str) -> StackResult<()> {
            self.record(StackOp::Close(profile_uri.to_string()));
            if self.failures.lock().unwrap().close {
                return Err(StackError::new(-3, "close failed"));
            }
            let mut state = self.state.lock().unwrap();
            state.intent = None;
            state.registered = false;
            Ok(())
        }

        async fn is_registered(&self, profile_uri: &str) -> StackResult<bool> {
            self.record(StackOp::IsRegistered(profile_uri.to_string()));
            if self.failures.lock().unwrap().is_registered {
                return Err(StackError::new(-1, "query failed"));
            }
            Ok(self.state.lock().unwrap().registered)
        }

        async fn make_audio_call(
            &self,
            profile_uri: &str,
            peer_uri: &str,
            listener: Arc<dyn CallListener>,
            _timeout: Duration,
        ) -> StackResult<Box<dyn AudioCall>> {
            self.record(StackOp::MakeCall {
                from: profile_uri.to_string(),
                to: peer_uri.to_string(),
            });
            if self.failures.lock().unwrap().make_call {
                return Err(StackError::new(-4, "cannot place call"));
            }
            Ok(self.new_call(listener))
        }

        async fn take_audio_call(
            &self,
            incoming: &IncomingCallPayload,
            listener: Arc<dyn CallListener>,
        ) -> StackResult<Box<dyn AudioCall>> {
            self.record(StackOp::TakeCall(incoming.call_id.clone()));
            if self.failures.lock().unwrap().take_call {
                return Err(StackError::new(-5, "call vanished"));
            }
            Ok(self.new_call(listener))
        }
    }

    #[derive(Default)]
    pub struct MockCallState {
        ops: Mutex<Vec<CallOp>>,
        muted: AtomicBool,
        fail_answer: bool,
        fail_peer: bool,
        peer: PeerProfile,
    }

    impl Default for PeerProfile {
        fn default() -> Self {
            PeerProfile::new(None, "")
        }
    }

    impl MockCallState {
        pub fn ops(&self) -> Vec<CallOp> {
            self.ops.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&CallOp) -> bool) -> usize {
            self.ops().iter().filter(|op| pred(op)).count()
        }

        pub fn is_muted(&self) -> bool {
            self.muted.load(Ordering::SeqCst)
        }

        pub fn was_closed(&self) -> bool {
            self.count(|op| *op == CallOp::Close) > 0
        }

        fn record(&self, op: CallOp) {
            self.ops.lock().unwrap().push(op);
        }
    }

    pub struct MockCall(Arc<MockCallState>);

    impl AudioCall for MockCall {
        fn answer_call(&self, timeout: Duration) -> StackResult<()> {
            self.0.record(CallOp::Answer(timeout));
            if self.0.fail_answer {
                return Err(StackError::new(-6, "answer failed"));
            }
            Ok(())
        }

        fn start_audio(&self) {
            self.0.record(CallOp::StartAudio);
        }

        fn set_speaker_mode(&self, on: bool) {
            self.0.record(CallOp::Speaker(on));
        }

        fn is_muted(&self) -> bool {
            self.0.is_muted()
        }

        fn toggle_mute(&self) {
            self.0.record(CallOp::ToggleMute);
            self.0.muted.fetch_xor(true, Ordering::SeqCst);
        }

        fn hold_call(&self, timeout: Duration) -> StackResult<()> {
            self.0.record(CallOp::Hold(timeout));
            Ok(())
        }

        fn continue_call(&self, timeout: Duration) -> StackResult<()> {
            self.0.record(CallOp::Continue(timeout));
            Ok(())
        }

        fn send_dtmf(&self, code: u8) {
            self.0.record(CallOp::Dtmf(code));
        }

        fn end_call(&self) -> StackResult<()> {
            self.0.record(CallOp::End);
            Ok(())
        }

        fn close(&self) {
            self.0.record(CallOp::Close);
        }

        fn peer_profile(&self) -> StackResult<PeerProfile> {
            if self.0.fail_peer {
                return Err(StackError::new(-7, "no peer profile"));
            }
            Ok(self.0.peer.clone())
        }
    }
}
