use std::fmt;

use smol_str::SmolStr;

/// SIP request methods understood by the server.
///
/// Extension methods are carried verbatim in [`Method::Unknown`] so a handler
/// can still be registered for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Update,
    Message,
    Prack,
    Refer,
    Subscribe,
    Notify,
    Publish,
    Unknown(SmolStr),
}

impl Method {
    /// Every standard method, in RFC registration order.
    pub const STANDARD: [Method; 14] = [
        Method::Invite,
        Method::Ack,
        Method::Cancel,
        Method::Bye,
        Method::Register,
        Method::Options,
        Method::Subscribe,
        Method::Notify,
        Method::Refer,
        Method::Info,
        Method::Message,
        Method::Prack,
        Method::Update,
        Method::Publish,
    ];

    /// Returns the canonical uppercase string representation for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning Unknown for extension methods.
    pub fn from_token(token: &str) -> Self {
        Self::STANDARD
            .iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(token))
            .cloned()
            .unwrap_or_else(|| Method::Unknown(SmolStr::new(token)))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
