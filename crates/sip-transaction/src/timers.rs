//! Transport-aware timer values per RFC 3261 §17.
//!
//! Reliable transports (TCP/TLS) never retransmit and skip the linger
//! timers that only exist to absorb retransmissions:
//!
//! | timer | UDP | TCP/TLS |
//! |---|---|---|
//! | A, E, G | T1 | 0 |
//! | B, F, H | 64·T1 | 64·T1 |
//! | D | 32s | 0 |
//! | I, K | T4 | 0 |
//! | J | 64·T1 | 0 |
//!
//! ```rust
//! use sip_transaction::timers::{Transport, TransportAwareTimers};
//! use sip_transaction::TransactionTimer;
//!
//! let timers = TransportAwareTimers::new(Transport::Tcp);
//! assert_eq!(timers.duration(TransactionTimer::K), std::time::Duration::ZERO);
//! assert_eq!(timers.duration(TransactionTimer::F), std::time::Duration::from_secs(32));
//! assert!(!timers.should_retransmit());
//! ```

use std::time::Duration;

use crate::TransactionTimer;

/// Transport protocol for timer calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Maps a Via / network transport token. Unknown tokens count as UDP so
    /// retransmission stays on.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "TCP" | "WS" => Transport::Tcp,
            "TLS" | "WSS" => Transport::Tls,
            _ => Transport::Udp,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Tls)
    }
}

/// RFC 3261 base timer values (Table 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTT estimate, default 500ms.
    pub t1: Duration,
    /// Maximum retransmit interval, default 4s.
    pub t2: Duration,
    /// Maximum time a message stays in the network, default 5s.
    pub t4: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerConfig {
    /// Scales every base timer from `t1`, keeping the RFC ratios
    /// (T2 = 8·T1, T4 = 10·T1).
    pub fn scaled(t1: Duration) -> Self {
        Self {
            t1,
            t2: t1.saturating_mul(8),
            t4: t1.saturating_mul(10),
        }
    }
}

/// Timer durations for one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: Transport,
    config: TimerConfig,
}

impl TransportAwareTimers {
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, TimerConfig::default())
    }

    pub fn with_config(transport: Transport, config: TimerConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Returns the duration for `timer`.
    ///
    /// ```
    /// use sip_transaction::timers::{TransportAwareTimers, Transport};
    /// use sip_transaction::TransactionTimer;
    /// use std::time::Duration;
    ///
    /// let udp = TransportAwareTimers::new(Transport::Udp);
    /// assert_eq!(udp.duration(TransactionTimer::K), Duration::from_secs(5));
    /// assert_eq!(udp.duration(TransactionTimer::Trying), Duration::from_secs(32));
    /// ```
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        let t1 = self.config.t1;
        let unless_reliable = |d: Duration| if reliable { Duration::ZERO } else { d };
        match timer {
            TransactionTimer::T1 => t1,
            TransactionTimer::T2 => self.config.t2,
            TransactionTimer::T4 => self.config.t4,
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => unless_reliable(t1),
            TransactionTimer::B
            | TransactionTimer::F
            | TransactionTimer::H
            | TransactionTimer::Trying => t1.saturating_mul(64),
            TransactionTimer::D => unless_reliable(Duration::from_secs(32).max(t1.saturating_mul(64))),
            TransactionTimer::I | TransactionTimer::K => unless_reliable(self.config.t4),
            TransactionTimer::J => unless_reliable(t1.saturating_mul(64)),
            TransactionTimer::C => Duration::from_secs(180),
        }
    }

    /// Retransmissions only happen over unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_uses_full_values() {
        let timers = TransportAwareTimers::new(Transport::Udp);
        assert_eq!(timers.duration(TransactionTimer::A), Duration::from_millis(500));
        assert_eq!(timers.duration(TransactionTimer::B), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::I), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::J), Duration::from_secs(32));
        assert!(timers.should_retransmit());
    }

    #[test]
    fn reliable_transports_zero_linger_timers() {
        for transport in [Transport::Tcp, Transport::Tls] {
            let timers = TransportAwareTimers::new(transport);
            for timer in [
                TransactionTimer::A,
                TransactionTimer::D,
                TransactionTimer::E,
                TransactionTimer::G,
                TransactionTimer::I,
                TransactionTimer::J,
                TransactionTimer::K,
            ] {
                assert_eq!(timers.duration(timer), Duration::ZERO, "{timer:?}");
            }
            assert_eq!(timers.duration(TransactionTimer::H), Duration::from_secs(32));
        }
    }

    #[test]
    fn scaled_config_keeps_ratios() {
        let config = TimerConfig::scaled(Duration::from_millis(10));
        assert_eq!(config.t2, Duration::from_millis(80));
        assert_eq!(config.t4, Duration::from_millis(100));
        let timers = TransportAwareTimers::with_config(Transport::Udp, config);
        assert_eq!(timers.duration(TransactionTimer::Trying), Duration::from_millis(640));
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
    }

    #[test]
    fn transport_tokens() {
        assert_eq!(Transport::from_token("tcp"), Transport::Tcp);
        assert_eq!(Transport::from_token("TLS"), Transport::Tls);
        assert_eq!(Transport::from_token("SCTP"), Transport::Udp);
    }
}
