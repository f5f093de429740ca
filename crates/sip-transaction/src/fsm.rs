use std::time::Duration;

use sip_core::{Request, Response};
use smol_str::SmolStr;

use crate::{
    timers::TransportAwareTimers, ClientInviteState, ClientNonInviteState, ServerInviteState,
    ServerNonInviteState, TransactionError, TransactionTimer,
};

/// Actions emitted by the server state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate {
        reason: SmolStr,
        error: Option<TransactionError>,
    },
}

/// Actions emitted by the client state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit(Request),
    Deliver(Response),
    /// Send an ACK for this non-2xx final response (RFC 3261 §17.1.1.3).
    GenerateAck(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate {
        reason: SmolStr,
        error: Option<TransactionError>,
    },
}

fn timeout(timer: TransactionTimer) -> Option<TransactionError> {
    Some(TransactionError::Timeout {
        timer: timer.name(),
    })
}

/// Input events for the server non-INVITE transaction.
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest,
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError(String),
}

/// Server non-INVITE transaction (RFC 3261 Figure 8).
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TransportAwareTimers,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest) => vec![ServerAction::Schedule {
                timer: TransactionTimer::Trying,
                duration: self.timers.duration(TransactionTimer::Trying),
            }],
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                self.last_provisional = Some(response.clone());
                vec![ServerAction::Transmit(response)]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.state = Completed;
                self.last_final = Some(response.clone());
                vec![
                    ServerAction::Cancel(TransactionTimer::Trying),
                    ServerAction::Transmit(response),
                    ServerAction::Schedule {
                        timer: TransactionTimer::J,
                        duration: self.timers.duration(TransactionTimer::J),
                    },
                ]
            }
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("Timer J expired"),
                    error: None,
                }]
            }
            (Trying | Proceeding, ServerNonInviteEvent::TimerFired(TransactionTimer::Trying)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("no final response"),
                    error: timeout(TransactionTimer::Trying),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerNonInviteEvent::TransportError(e)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    error: Some(TransactionError::Transport(e)),
                }]
            }
            _ => Vec::new(),
        }
    }

    /// A retransmitted request replays the last response sent.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        let last = match self.state {
            ServerNonInviteState::Proceeding => self.last_provisional.as_ref(),
            ServerNonInviteState::Completed => self.last_final.as_ref(),
            _ => None,
        };
        last.cloned().map(ServerAction::Transmit).into_iter().collect()
    }
}

/// Input events for the server INVITE transaction.
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite,
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(TransactionTimer),
    TransportError(String),
}

/// Server INVITE transaction (RFC 3261 Figure 7).
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.duration(TransactionTimer::T1),
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveInvite) => vec![ServerAction::Schedule {
                timer: TransactionTimer::Trying,
                duration: self.timers.duration(TransactionTimer::Trying),
            }],
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                self.last_provisional = Some(response.clone());
                vec![ServerAction::Transmit(response)]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => self.send_final(response),
            (Completed, ServerInviteEvent::ReceiveAck) => {
                self.state = Confirmed;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    ServerAction::Cancel(TransactionTimer::H),
                    ServerAction::Schedule {
                        timer: TransactionTimer::I,
                        duration: self.timers.duration(TransactionTimer::I),
                    },
                ]
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => {
                self.g_interval = (self.g_interval * 2).min(self.timers.duration(TransactionTimer::T2));
                match &self.last_final {
                    Some(response) => vec![
                        ServerAction::Transmit(response.clone()),
                        ServerAction::Schedule {
                            timer: TransactionTimer::G,
                            duration: self.g_interval,
                        },
                    ],
                    None => Vec::new(),
                }
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    ServerAction::Terminate {
                        reason: SmolStr::new("Timer H expired"),
                        error: timeout(TransactionTimer::H),
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("Timer I expired"),
                    error: None,
                }]
            }
            (Proceeding, ServerInviteEvent::TimerFired(TransactionTimer::Trying)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("no final response"),
                    error: timeout(TransactionTimer::Trying),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerInviteEvent::TransportError(e)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    error: Some(TransactionError::Transport(e)),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn send_final(&mut self, response: Response) -> Vec<ServerAction> {
        if response.is_success() {
            // 2xx retransmission belongs to the TU (RFC 3261 §13.3.1.4).
            self.state = ServerInviteState::Terminated;
            return vec![
                ServerAction::Cancel(TransactionTimer::Trying),
                ServerAction::Transmit(response),
                ServerAction::Terminate {
                    reason: SmolStr::new("2xx sent"),
                    error: None,
                },
            ];
        }

        self.state = ServerInviteState::Completed;
        self.last_final = Some(response.clone());
        self.g_interval = self.timers.duration(TransactionTimer::G);
        let mut actions = vec![
            ServerAction::Cancel(TransactionTimer::Trying),
            ServerAction::Transmit(response),
        ];
        if self.timers.should_retransmit() {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(ServerAction::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        actions
    }

    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        let last = match self.state {
            ServerInviteState::Proceeding => self.last_provisional.as_ref(),
            ServerInviteState::Completed => self.last_final.as_ref(),
            _ => None,
        };
        last.cloned().map(ServerAction::Transmit).into_iter().collect()
    }
}

/// Events that drive the client non-INVITE transaction.
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError(String),
}

/// Client non-INVITE transaction (RFC 3261 Figure 6).
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    last_request: Option<Request>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.duration(TransactionTimer::E),
            timers,
            last_request: None,
        }
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => {
                self.last_request = Some(request.clone());
                let mut actions = vec![ClientAction::Transmit(request)];
                if self.timers.should_retransmit() {
                    actions.push(ClientAction::Schedule {
                        timer: TransactionTimer::E,
                        duration: self.e_interval,
                    });
                }
                actions.push(ClientAction::Schedule {
                    timer: TransactionTimer::F,
                    duration: self.timers.duration(TransactionTimer::F),
                });
                actions
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![ClientAction::Deliver(response)]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    ClientAction::Cancel(TransactionTimer::E),
                    ClientAction::Cancel(TransactionTimer::F),
                    ClientAction::Deliver(response),
                    ClientAction::Schedule {
                        timer: TransactionTimer::K,
                        duration: self.timers.duration(TransactionTimer::K),
                    },
                ]
            }
            (state @ (Trying | Proceeding), ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                let t2 = self.timers.duration(TransactionTimer::T2);
                self.e_interval = if state == Proceeding {
                    t2
                } else {
                    (self.e_interval * 2).min(t2)
                };
                match &self.last_request {
                    Some(request) => vec![
                        ClientAction::Transmit(request.clone()),
                        ClientAction::Schedule {
                            timer: TransactionTimer::E,
                            duration: self.e_interval,
                        },
                    ],
                    None => Vec::new(),
                }
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::E),
                    ClientAction::Terminate {
                        reason: SmolStr::new("Timer F expired"),
                        error: timeout(TransactionTimer::F),
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("Timer K expired"),
                    error: None,
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientNonInviteEvent::TransportError(e)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    error: Some(TransactionError::Transport(e)),
                }]
            }
            _ => Vec::new(),
        }
    }
}

/// Events that drive the client INVITE transaction.
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError(String),
}

/// Client INVITE transaction (RFC 3261 Figure 5).
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    last_invite: Option<Request>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.duration(TransactionTimer::A),
            timers,
            last_invite: None,
        }
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => {
                self.last_invite = Some(invite.clone());
                let mut actions = vec![ClientAction::Transmit(invite)];
                if self.timers.should_retransmit() {
                    actions.push(ClientAction::Schedule {
                        timer: TransactionTimer::A,
                        duration: self.a_interval,
                    });
                }
                actions.push(ClientAction::Schedule {
                    timer: TransactionTimer::B,
                    duration: self.timers.duration(TransactionTimer::B),
                });
                actions
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Deliver(response),
                ]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                if response.is_success() {
                    self.state = Terminated;
                    vec![
                        ClientAction::Cancel(TransactionTimer::A),
                        ClientAction::Cancel(TransactionTimer::B),
                        ClientAction::Deliver(response),
                        ClientAction::Terminate {
                            reason: SmolStr::new("2xx received"),
                            error: None,
                        },
                    ]
                } else {
                    self.state = Completed;
                    vec![
                        ClientAction::Cancel(TransactionTimer::A),
                        ClientAction::Cancel(TransactionTimer::B),
                        ClientAction::Deliver(response.clone()),
                        ClientAction::GenerateAck(response),
                        ClientAction::Schedule {
                            timer: TransactionTimer::D,
                            duration: self.timers.duration(TransactionTimer::D),
                        },
                    ]
                }
            }
            // Retransmitted final: ACK again, nothing goes up.
            (Completed, ClientInviteEvent::ReceiveFinal(response)) if !response.is_success() => {
                vec![ClientAction::GenerateAck(response)]
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => {
                self.a_interval = (self.a_interval * 2).min(self.timers.duration(TransactionTimer::T2));
                match &self.last_invite {
                    Some(invite) => vec![
                        ClientAction::Transmit(invite.clone()),
                        ClientAction::Schedule {
                            timer: TransactionTimer::A,
                            duration: self.a_interval,
                        },
                    ],
                    None => Vec::new(),
                }
            }
            (Calling | Proceeding, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Terminate {
                        reason: SmolStr::new("Timer B expired"),
                        error: timeout(TransactionTimer::B),
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("Timer D expired"),
                    error: None,
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientInviteEvent::TransportError(e)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("transport error"),
                    error: Some(TransactionError::Transport(e)),
                }]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::Transport;
    use bytes::Bytes;
    use sip_core::{Headers, Method, RequestLine, SipUri, StatusLine};

    fn udp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Udp)
    }

    fn tcp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Tcp)
    }

    fn request(method: Method) -> Request {
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:example.com").unwrap()),
            Headers::new(),
            Bytes::new(),
        )
        .unwrap()
    }

    fn response(code: u16) -> Response {
        Response::new(StatusLine::new(code, "Reason").unwrap(), Headers::new(), Bytes::new())
            .unwrap()
    }

    fn schedules(actions: &[ServerAction], timer: TransactionTimer) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, ServerAction::Schedule { timer: t, .. } if *t == timer))
    }

    fn terminate_error(actions: &[ServerAction]) -> Option<Option<TransactionError>> {
        actions.iter().find_map(|a| match a {
            ServerAction::Terminate { error, .. } => Some(error.clone()),
            _ => None,
        })
    }

    #[test]
    fn server_non_invite_happy_path() {
        let mut fsm = ServerNonInviteFsm::new(udp());
        let actions = fsm.on_event(ServerNonInviteEvent::ReceiveRequest);
        assert!(schedules(&actions, TransactionTimer::Trying));

        let actions = fsm.on_event(ServerNonInviteEvent::SendFinal(response(200)));
        assert_eq!(fsm.state, ServerNonInviteState::Completed);
        assert!(actions.contains(&ServerAction::Cancel(TransactionTimer::Trying)));
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(_))));
        assert!(schedules(&actions, TransactionTimer::J));

        assert_eq!(fsm.on_retransmit().len(), 1);

        let actions = fsm.on_event(ServerNonInviteEvent::TimerFired(TransactionTimer::J));
        assert_eq!(fsm.state, ServerNonInviteState::Terminated);
        assert_eq!(terminate_error(&actions), Some(None));
    }

    #[test]
    fn server_non_invite_trying_guard_times_out() {
        let mut fsm = ServerNonInviteFsm::new(udp());
        fsm.on_event(ServerNonInviteEvent::ReceiveRequest);
        assert!(fsm.on_retransmit().is_empty());
        let actions = fsm.on_event(ServerNonInviteEvent::TimerFired(TransactionTimer::Trying));
        assert_eq!(
            terminate_error(&actions),
            Some(Some(TransactionError::Timeout { timer: "trying" }))
        );
        assert!(fsm
            .on_event(ServerNonInviteEvent::SendFinal(response(200)))
            .is_empty());
    }

    #[test]
    fn server_invite_non2xx_waits_for_ack() {
        let mut fsm = ServerInviteFsm::new(udp());
        fsm.on_event(ServerInviteEvent::ReceiveInvite);
        fsm.on_event(ServerInviteEvent::SendProvisional(response(180)));
        assert_eq!(fsm.on_retransmit().len(), 1);

        let actions = fsm.on_event(ServerInviteEvent::SendFinal(response(486)));
        assert_eq!(fsm.state, ServerInviteState::Completed);
        assert!(schedules(&actions, TransactionTimer::G));
        assert!(schedules(&actions, TransactionTimer::H));

        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::G));
        assert!(actions.iter().any(|a| matches!(a, ServerAction::Transmit(r) if r.code() == 486)));

        let actions = fsm.on_event(ServerInviteEvent::ReceiveAck);
        assert_eq!(fsm.state, ServerInviteState::Confirmed);
        assert!(schedules(&actions, TransactionTimer::I));

        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::I));
        assert_eq!(terminate_error(&actions), Some(None));
    }

    #[test]
    fn server_invite_2xx_terminates_immediately() {
        let mut fsm = ServerInviteFsm::new(udp());
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(response(200)));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert_eq!(terminate_error(&actions), Some(None));
    }

    #[test]
    fn server_invite_timer_h_reports_timeout() {
        let mut fsm = ServerInviteFsm::new(tcp());
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(response(500)));
        assert!(!schedules(&actions, TransactionTimer::G));
        let actions = fsm.on_event(ServerInviteEvent::TimerFired(TransactionTimer::H));
        assert_eq!(
            terminate_error(&actions),
            Some(Some(TransactionError::Timeout { timer: "H" }))
        );
    }

    #[test]
    fn client_non_invite_happy_path() {
        let mut fsm = ClientNonInviteFsm::new(udp());
        let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(request(Method::Options)));
        assert!(matches!(actions[0], ClientAction::Transmit(_)));

        let actions = fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response(100)));
        assert_eq!(fsm.state, ClientNonInviteState::Proceeding);
        assert!(matches!(actions[0], ClientAction::Deliver(_)));

        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::E));
        assert!(actions.contains(&ClientAction::Schedule {
            timer: TransactionTimer::E,
            duration: Duration::from_secs(4),
        }));

        fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response(200)));
        assert_eq!(fsm.state, ClientNonInviteState::Completed);
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(TransactionTimer::K));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(matches!(actions[0], ClientAction::Terminate { error: None, .. }));
    }

    #[test]
    fn client_non_invite_over_tcp_does_not_retransmit() {
        let mut fsm = ClientNonInviteFsm::new(tcp());
        let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(request(Method::Message)));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClientAction::Schedule { timer: TransactionTimer::E, .. })));
    }

    #[test]
    fn client_invite_non2xx_generates_ack() {
        let mut fsm = ClientInviteFsm::new(udp());
        fsm.on_event(ClientInviteEvent::SendInvite(request(Method::Invite)));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(response(486)));
        assert_eq!(fsm.state, ClientInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::GenerateAck(_))));

        let again = fsm.on_event(ClientInviteEvent::ReceiveFinal(response(486)));
        assert_eq!(again.len(), 1);
        assert!(matches!(again[0], ClientAction::GenerateAck(_)));
    }

    #[test]
    fn client_invite_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(udp());
        fsm.on_event(ClientInviteEvent::SendInvite(request(Method::Invite)));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::A));
        assert!(matches!(actions[0], ClientAction::Transmit(_)));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(TransactionTimer::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(
            a,
            ClientAction::Terminate {
                error: Some(TransactionError::Timeout { timer: "B" }),
                ..
            }
        )));
    }
}
