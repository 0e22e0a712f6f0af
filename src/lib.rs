// lib.rs - Main library module for the SIP agent

// One file per component, re-exported flat from the crate root

#[path = "call.rs"]
mod call;
#[path = "client.rs"]
mod client;
#[path = "core.rs"]
mod core;
#[path = "incoming.rs"]
mod incoming;
#[path = "profile.rs"]
mod profile;
#[path = "registration.rs"]
mod registration;
#[path = "stack.rs"]
mod stack;

pub mod event_system;

// Re-export core types
pub use crate::call::*;
pub use crate::client::*;
pub use crate::core::*;
pub use crate::event_system::{Event, EventDispatcher, Payload};
pub use crate::incoming::{
    IncomingCallChannel, IncomingCallIntent, IncomingCallNotification, IncomingCallPayload,
};
pub use crate::profile::*;
pub use crate::registration::*;
pub use crate::stack::{
    AudioCall, CallListener, LocalSipStack, PeerProfile, RegistrationListener, SipStack,
};

// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        // Stack seam
        AudioCall,
        CallListener,
        // States
        CallState,
        ErrorEventPolicy,
        // Events
        Event,
        EventKind,
        IncomingCallChannel,
        IncomingCallPayload,
        PayloadValue,
        PeerProfile,
        // Configuration
        Profile,
        ProfileConfig,
        RegistrationListener,
        RegistrationState,
        // Core types
        Result,
        // Main API
        SipClient,
        SipClientBuilder,
        SipError,
        SipStack,
        SipUri,
        StackError,
        StackResult,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
