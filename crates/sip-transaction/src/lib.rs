//! RFC 3261 §17 transactions for the server: sans-IO state machines in
//! [`fsm`], transport-aware timer values in [`timers`] and the async runtime
//! that owns live transactions in [`layer`].

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Method, Request, Response};
use smol_str::SmolStr;
use thiserror::Error;

pub mod fsm;
pub mod layer;
pub mod timers;

pub use fsm::{
    ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
    ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
};
pub use layer::{ClientTransaction, ServerTransaction, TransactionLayer, TransactionUser};
pub use timers::{TimerConfig, TransportAwareTimers};

/// Item type of a transaction's error stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("transaction timed out (timer {timer})")]
    Timeout { timer: &'static str },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transaction terminated")]
    Terminated,
}

/// Extracts the `branch` parameter of the top Via.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = req.headers().top_via()?;
    via.branch().map(SmolStr::new)
}

/// Method named in the CSeq header.
pub fn cseq_method(headers: &sip_core::Headers) -> Option<Method> {
    let cseq = headers.get("CSeq")?;
    let method = cseq.split_whitespace().nth(1)?;
    Some(Method::from_token(method))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    SmolStr::new(format!("z9hG4bK{}", random_token(16)))
}

/// Generates a random From/To tag.
pub fn generate_tag() -> SmolStr {
    SmolStr::new(random_token(10))
}

/// Timers referenced by the transaction state machines (RFC 3261 §17).
///
/// `Trying` is not an RFC timer: it bounds how long a server transaction may
/// wait for its transaction user to send a final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    T1,
    T2,
    T4,
    Trying,
}

impl TransactionTimer {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionTimer::A => "A",
            TransactionTimer::B => "B",
            TransactionTimer::C => "C",
            TransactionTimer::D => "D",
            TransactionTimer::E => "E",
            TransactionTimer::F => "F",
            TransactionTimer::G => "G",
            TransactionTimer::H => "H",
            TransactionTimer::I => "I",
            TransactionTimer::J => "J",
            TransactionTimer::K => "K",
            TransactionTimer::T1 => "T1",
            TransactionTimer::T2 => "T2",
            TransactionTimer::T4 => "T4",
            TransactionTimer::Trying => "trying",
        }
    }
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Unique key identifying a transaction (branch + method + direction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Builds a key from a request's top Via branch and method.
    pub fn from_request(req: &Request, is_server: bool) -> Option<Self> {
        Some(Self {
            branch: request_branch_id(req)?,
            method: req.method().clone(),
            is_server,
        })
    }

    /// Client key matching a response: top Via branch + CSeq method
    /// (RFC 3261 §17.1.3).
    pub fn from_response(res: &Response) -> Option<Self> {
        let via = res.headers().top_via()?;
        Some(Self {
            branch: SmolStr::new(via.branch()?),
            method: cseq_method(res.headers())?,
            is_server: false,
        })
    }

    /// Key of the INVITE server transaction an ACK or CANCEL refers to.
    pub fn invite_sibling(&self) -> Self {
        Self {
            branch: self.branch.clone(),
            method: Method::Invite,
            is_server: self.is_server,
        }
    }
}
