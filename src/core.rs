// Core error types and shared state
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Timeout handed to the stack for make-call, answer, auto-answer, hold and continue.
pub const STACK_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Pre-flight configuration failures. These are the only errors surfaced
/// synchronously to the caller of `register()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} required")]
    MissingField(&'static str),
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),
    #[error("not a valid SIP identity: {0}")]
    InvalidIdentity(String),
}

/// Failure reported by the underlying SIP stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stack error {code}: {message}")]
pub struct StackError {
    pub code: i32,
    pub message: String,
}

impl StackError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        StackError {
            code,
            message: message.into(),
        }
    }
}

pub type StackResult<T> = std::result::Result<T, StackError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error("registration failed: {0}")]
    Registration(StackError),
    #[error("call setup failed: {0}")]
    CallSetup(StackError),
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

pub type Result<T> = std::result::Result<T, SipError>;

// SIP URI, only as much as profile identities and call targets need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        let scheme_end = uri
            .find(':')
            .ok_or_else(|| SipError::InvalidUri(format!("no scheme in '{}'", uri)))?;
        let scheme = uri[..scheme_end].to_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(SipError::InvalidUri(format!("invalid scheme: {}", scheme)));
        }

        let rest = &uri[scheme_end + 1..];
        // Parameters and headers are carried by the stack, not by us.
        let rest = rest.split([';', '?']).next().unwrap_or_default();

        let (user, host_part) = match rest.rfind('@') {
            Some(at_pos) => {
                let user_part = &rest[..at_pos];
                // Drop an embedded password, it never belongs in an identity.
                let user = user_part.split(':').next().unwrap_or_default();
                (Some(user.to_string()), &rest[at_pos + 1..])
            }
            None => (None, rest),
        };

        let (host, port) = if let Some(stripped) = host_part.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| SipError::InvalidUri("invalid IPv6 address".to_string()))?;
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .map(parse_port)
                .transpose()?;
            (stripped[..end].to_string(), port)
        } else {
            match host_part.split_once(':') {
                Some((host, port)) => (host.to_string(), Some(parse_port(port)?)),
                None => (host_part.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(SipError::InvalidUri(format!("no host in '{}'", uri)));
        }
        if matches!(user.as_deref(), Some("")) {
            return Err(SipError::InvalidUri(format!("empty user in '{}'", uri)));
        }

        Ok(SipUri {
            scheme,
            user,
            host,
            port,
        })
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| SipError::InvalidUri(format!("invalid port: {}", port)))
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

// Identifies the emitting session in every event payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Registration states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed { code: i32, message: String },
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered)
    }
}

// Call states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    RingingBack,
    /// Inbound call claimed and waiting to be answered.
    Ringing,
    Established,
    OnHold,
    Ended,
    Error { code: i32, message: String },
}

impl CallState {
    /// A call exists and has not reached a terminal state.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            CallState::Idle | CallState::Ended | CallState::Error { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Error { .. })
    }

    /// Outbound setup phase: INVITE sent, no final answer yet.
    pub fn is_dialing(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::RingingBack)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, CallState::Established | CallState::OnHold)
    }
}

/// Closed set of lifecycle events. The names are the callback names the
/// host bridge registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum EventKind {
    #[cfg_attr(feature = "serialization", serde(rename = "onregistering"))]
    Registering,
    #[cfg_attr(feature = "serialization", serde(rename = "onregistrationdone"))]
    RegistrationDone,
    #[cfg_attr(feature = "serialization", serde(rename = "onregistrationfailed"))]
    RegistrationFailed,
    #[cfg_attr(feature = "serialization", serde(rename = "oncallestablished"))]
    CallEstablished,
    #[cfg_attr(feature = "serialization", serde(rename = "oncallended"))]
    CallEnded,
    #[cfg_attr(feature = "serialization", serde(rename = "oncallbusy"))]
    CallBusy,
    #[cfg_attr(feature = "serialization", serde(rename = "onerror"))]
    Error,
    #[cfg_attr(feature = "serialization", serde(rename = "onringingback"))]
    RingingBack,
    #[cfg_attr(feature = "serialization", serde(rename = "onincomingcall"))]
    IncomingCall,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Registering,
        EventKind::RegistrationDone,
        EventKind::RegistrationFailed,
        EventKind::CallEstablished,
        EventKind::CallEnded,
        EventKind::CallBusy,
        EventKind::Error,
        EventKind::RingingBack,
        EventKind::IncomingCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Registering => "onregistering",
            EventKind::RegistrationDone => "onregistrationdone",
            EventKind::RegistrationFailed => "onregistrationfailed",
            EventKind::CallEstablished => "oncallestablished",
            EventKind::CallEnded => "oncallended",
            EventKind::CallBusy => "oncallbusy",
            EventKind::Error => "onerror",
            EventKind::RingingBack => "onringingback",
            EventKind::IncomingCall => "onincomingcall",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let name = s.to_ascii_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Value stored in an event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(untagged))]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PayloadValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Str(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Str(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Int(value)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Int(value.into())
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl<T: Into<PayloadValue>> From<Option<T>> for PayloadValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PayloadValue::Null, Into::into)
    }
}
