//! SIP identity and credentials.
//!
//! A [`ProfileConfig`] is what the embedding application hands us; a
//! [`Profile`] is the validated, immutable bundle the registration manager
//! opens a stack session with. Optional settings stay unset unless the
//! configuration carries them, so the stack's own defaults apply.

use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Deserializer, Serialize};

use crate::{SipUri, ValidationError};

/// Raw profile settings as supplied by the application.
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serialization", serde(default, rename_all = "camelCase"))]
pub struct ProfileConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub domain: Option<String>,
    pub outbound_proxy: Option<String>,
    /// The bridge may send numbers as floats; whole values are accepted.
    #[cfg_attr(feature = "serialization", serde(deserialize_with = "whole_number"))]
    pub port: Option<u32>,
    pub protocol: Option<String>,
    pub auto_registration: Option<bool>,
    pub send_keep_alive: Option<bool>,
    pub display_name: Option<String>,
    pub auth_username: Option<String>,
}

#[cfg(feature = "serialization")]
fn whole_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(n) = number.as_u64() {
        return u32::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("number out of range: {}", number)));
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&f) => {
            Ok(Some(f as u32))
        }
        _ => Err(D::Error::custom(format!("expected a whole number, got {}", number))),
    }
}

impl ProfileConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        ProfileConfig {
            username: Some(username.into()),
            password: Some(password.into()),
            domain: Some(domain.into()),
            ..Default::default()
        }
    }

    /// Parses the host bridge's camelCase property bag.
    #[cfg(feature = "serialization")]
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl fmt::Debug for ProfileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .field("outbound_proxy", &self.outbound_proxy)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("auto_registration", &self.auto_registration)
            .field("send_keep_alive", &self.send_keep_alive)
            .field("display_name", &self.display_name)
            .field("auth_username", &self.auth_username)
            .finish()
    }
}

/// Validated SIP identity. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Profile {
    username: String,
    domain: String,
    password: String,
    outbound_proxy: Option<String>,
    port: Option<u16>,
    protocol: Option<String>,
    auto_registration: Option<bool>,
    send_keep_alive: Option<bool>,
    display_name: Option<String>,
    auth_username: Option<String>,
    uri: SipUri,
}

impl Profile {
    pub fn builder(username: impl Into<String>, domain: impl Into<String>) -> ProfileBuilder {
        ProfileBuilder::new(username, domain)
    }

    /// Validates `config` and builds a profile from it.
    pub fn from_config(config: &ProfileConfig) -> Result<Self, ValidationError> {
        ProfileBuilder::from_config(config)?.build()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn outbound_proxy(&self) -> Option<&str> {
        self.outbound_proxy.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn auth_username(&self) -> Option<&str> {
        self.auth_username.as_deref()
    }

    /// Whether the stack keeps the profile registered on its own. Unset means
    /// the stack default, which is on.
    pub fn auto_registration(&self) -> bool {
        self.auto_registration.unwrap_or(true)
    }

    pub fn send_keep_alive(&self) -> bool {
        self.send_keep_alive.unwrap_or(false)
    }

    /// The explicitly configured flags, `None` where the stack default applies.
    pub fn flags(&self) -> (Option<bool>, Option<bool>) {
        (self.auto_registration, self.send_keep_alive)
    }

    pub fn uri(&self) -> SipUri {
        self.uri.clone()
    }

    /// Canonical identity the stack keys sessions and listeners by.
    pub fn uri_string(&self) -> String {
        self.uri().to_string()
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("uri", &self.uri_string())
            .field("outbound_proxy", &self.outbound_proxy)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("auto_registration", &self.auto_registration)
            .field("send_keep_alive", &self.send_keep_alive)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Profile`].
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    username: String,
    domain: String,
    password: Option<String>,
    outbound_proxy: Option<String>,
    port: Option<u32>,
    protocol: Option<String>,
    auto_registration: Option<bool>,
    send_keep_alive: Option<bool>,
    display_name: Option<String>,
    auth_username: Option<String>,
}

impl ProfileBuilder {
    pub fn new(username: impl Into<String>, domain: impl Into<String>) -> Self {
        ProfileBuilder {
            username: username.into(),
            domain: domain.into(),
            password: None,
            outbound_proxy: None,
            port: None,
            protocol: None,
            auto_registration: None,
            send_keep_alive: None,
            display_name: None,
            auth_username: None,
        }
    }

    /// Starts a builder from application configuration, failing fast when a
    /// required field is absent or empty.
    pub fn from_config(config: &ProfileConfig) -> Result<Self, ValidationError> {
        let username = required(config.username.as_deref(), "username")?;
        let password = required(config.password.as_deref(), "password")?;
        let domain = required(config.domain.as_deref(), "domain")?;

        let mut builder = ProfileBuilder::new(username, domain).password(password);
        builder.outbound_proxy = config.outbound_proxy.clone();
        builder.port = config.port;
        builder.protocol = config.protocol.clone();
        builder.auto_registration = config.auto_registration;
        builder.send_keep_alive = config.send_keep_alive;
        builder.display_name = config.display_name.clone();
        builder.auth_username = config.auth_username.clone();
        Ok(builder)
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn outbound_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.outbound_proxy = Some(proxy.into());
        self
    }

    pub fn port(mut self, port: u32) -> Self {
        self.port = Some(port);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn auto_registration(mut self, enabled: bool) -> Self {
        self.auto_registration = Some(enabled);
        self
    }

    pub fn send_keep_alive(mut self, enabled: bool) -> Self {
        self.send_keep_alive = Some(enabled);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn auth_username(mut self, name: impl Into<String>) -> Self {
        self.auth_username = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Profile, ValidationError> {
        let username = required(Some(self.username.as_str()), "username")?.trim().to_string();
        let password = required(self.password.as_deref(), "password")?.to_string();
        let domain = required(Some(self.domain.as_str()), "domain")?.trim().to_string();
        let uri = identity_uri(&username, &domain)?;

        let port = self
            .port
            .map(|port| {
                u16::try_from(port)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or(ValidationError::InvalidPort(port))
            })
            .transpose()?;

        Ok(Profile {
            username,
            domain,
            password,
            outbound_proxy: self.outbound_proxy,
            port,
            protocol: self.protocol,
            auto_registration: self.auto_registration,
            send_keep_alive: self.send_keep_alive,
            display_name: self.display_name,
            auth_username: self.auth_username,
            uri,
        })
    }
}

// Whitespace-only counts as missing. Callers decide what to trim.
fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ValidationError::MissingField(field))
}

/// `sip:user@domain`, where `domain` is a host with an optional port. The
/// parsed URI must name exactly this user.
fn identity_uri(username: &str, domain: &str) -> Result<SipUri, ValidationError> {
    let invalid = || ValidationError::InvalidIdentity(format!("{}@{}", username, domain));

    let stray = |c: char| c.is_whitespace() || matches!(c, ';' | '?' | '@');
    if username.contains(stray) || domain.contains(stray) {
        return Err(invalid());
    }

    let uri = SipUri::parse(&format!("sip:{}@{}", username, domain)).map_err(|_| invalid())?;
    if uri.user.as_deref() != Some(username) {
        return Err(invalid());
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_fields() {
        let full = ProfileConfig::new("alice", "secret", "example.com");

        let mut cfg = full.clone();
        cfg.username = None;
        assert_eq!(
            Profile::from_config(&cfg),
            Err(ValidationError::MissingField("username"))
        );

        let mut cfg = full.clone();
        cfg.password = Some(String::new());
        assert_eq!(
            Profile::from_config(&cfg),
            Err(ValidationError::MissingField("password"))
        );

        let mut cfg = full;
        cfg.domain = Some("   ".to_string());
        assert_eq!(
            Profile::from_config(&cfg),
            Err(ValidationError::MissingField("domain"))
        );
    }

    #[test]
    fn test_optional_fields_kept_verbatim() {
        let cfg = ProfileConfig {
            outbound_proxy: Some("proxy.example.com".to_string()),
            port: Some(5070),
            protocol: Some("TCP".to_string()),
            ..ProfileConfig::new("alice", "secret", "example.com")
        };

        let profile = Profile::from_config(&cfg).unwrap();
        assert_eq!(profile.outbound_proxy(), Some("proxy.example.com"));
        assert_eq!(profile.port(), Some(5070));
        assert_eq!(profile.protocol(), Some("TCP"));
        assert_eq!(profile.uri_string(), "sip:alice@example.com");
    }

    #[test]
    fn test_omitted_fields_stay_unset() {
        let profile = Profile::from_config(&ProfileConfig::new("alice", "secret", "example.com"))
            .unwrap();
        assert_eq!(profile.outbound_proxy(), None);
        assert_eq!(profile.port(), None);
        assert_eq!(profile.protocol(), None);
        assert_eq!(profile.flags(), (None, None));
        assert!(profile.auto_registration());
        assert!(!profile.send_keep_alive());
    }

    #[test]
    fn test_port_range() {
        let base = ProfileConfig::new("alice", "secret", "example.com");
        for bad in [0, 65536, 100_000] {
            let cfg = ProfileConfig {
                port: Some(bad),
                ..base.clone()
            };
            assert_eq!(
                Profile::from_config(&cfg),
                Err(ValidationError::InvalidPort(bad))
            );
        }
    }

    #[test]
    fn test_domain_with_port() {
        let profile =
            Profile::from_config(&ProfileConfig::new("alice", "pw", "example.com:5060")).unwrap();
        assert_eq!(profile.uri_string(), "sip:alice@example.com:5060");
        assert_eq!(profile.uri().port, Some(5060));
        assert_eq!(profile.domain(), "example.com:5060");

        let profile =
            Profile::from_config(&ProfileConfig::new("alice", "pw", "[2001:db8::1]:5060")).unwrap();
        assert_eq!(profile.uri_string(), "sip:alice@[2001:db8::1]:5060");
    }

    #[test]
    fn test_identity_is_trimmed() {
        let profile =
            Profile::from_config(&ProfileConfig::new(" alice ", " pw ", " example.com ")).unwrap();
        assert_eq!(profile.username(), "alice");
        assert_eq!(profile.domain(), "example.com");
        assert_eq!(profile.uri_string(), "sip:alice@example.com");
        // Passwords are taken as given.
        assert_eq!(profile.password(), " pw ");
    }

    #[test]
    fn test_malformed_identity_rejected() {
        for (user, domain) in [
            ("alice", "example.com:abc"),
            ("alice", "bob@example.com"),
            ("al ice", "example.com"),
            ("al:ice", "example.com"),
            ("alice", "example.com;transport=tcp"),
        ] {
            let err = Profile::from_config(&ProfileConfig::new(user, "pw", domain)).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidIdentity(_)),
                "{}@{} gave {:?}",
                user,
                domain,
                err
            );
        }
    }

    #[test]
    fn test_builder_flags() {
        let profile = Profile::builder("bob", "example.org")
            .password("pw")
            .auto_registration(false)
            .send_keep_alive(true)
            .display_name("Bob")
            .build()
            .unwrap();
        assert!(!profile.auto_registration());
        assert!(profile.send_keep_alive());
        assert_eq!(profile.display_name(), Some("Bob"));

        assert!(Profile::builder("bob", "example.org").build().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let cfg = ProfileConfig::new("alice", "hunter2", "example.com");
        assert!(!format!("{:?}", cfg).contains("hunter2"));
        let profile = Profile::from_config(&cfg).unwrap();
        assert!(!format!("{:?}", profile).contains("hunter2"));
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_from_bridge_json() {
        let cfg = ProfileConfig::from_json(
            r#"{"username":"alice","password":"pw","domain":"example.com",
                "outboundProxy":"proxy.example.com","sendKeepAlive":true}"#,
        )
        .unwrap();
        assert_eq!(cfg.outbound_proxy.as_deref(), Some("proxy.example.com"));
        assert_eq!(cfg.send_keep_alive, Some(true));
        assert_eq!(cfg.port, None);
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_port_from_bridge_number() {
        let base = r#""username":"alice","password":"pw","domain":"example.com""#;

        let cfg = ProfileConfig::from_json(&format!(r#"{{{},"port":5060.0}}"#, base)).unwrap();
        assert_eq!(cfg.port, Some(5060));
        let cfg = ProfileConfig::from_json(&format!(r#"{{{},"port":5061}}"#, base)).unwrap();
        assert_eq!(cfg.port, Some(5061));
        let cfg = ProfileConfig::from_json(&format!(r#"{{{},"port":null}}"#, base)).unwrap();
        assert_eq!(cfg.port, None);

        for bad in ["5060.5", "-1", "\"5060\""] {
            let json = format!(r#"{{{},"port":{}}}"#, base, bad);
            assert!(ProfileConfig::from_json(&json).is_err(), "accepted {}", bad);
        }
    }
}
