// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sip_core::{Method, Request, Response, SipMessage};
use sip_dns::StaticResolver;
use sip_server::{
    with_dns_resolver, with_ip, with_logger, with_transaction_timers, ConfigError, Server,
    ServerError,
};
use sip_testkit::{
    build_request, build_response, response_as_bytes, wait_for, LogCapture, TcpPeer, UdpPeer,
};
use sip_transaction::{ServerTransaction, TimerConfig};
use sip_transport::TransportKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ADVERTISED: &str = "192.0.2.1:5060";

struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    cancel: CancellationToken,
    serving: JoinHandle<Result<(), ServerError>>,
    logs: LogCapture,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        self.serving.await.unwrap().unwrap();
    }
}

fn new_server(logs: &LogCapture) -> Arc<Server> {
    Arc::new(
        Server::new([
            with_ip(ADVERTISED),
            with_dns_resolver(StaticResolver::default()),
            with_transaction_timers(TimerConfig::scaled(Duration::from_millis(10))),
            with_logger(logs.dispatch()),
        ])
        .unwrap(),
    )
}

/// Starts `server` on an ephemeral UDP port once `register` has installed
/// its handlers.
async fn start(register: impl FnOnce(&Arc<Server>)) -> Running {
    let logs = LogCapture::new();
    let server = new_server(&logs);
    register(&server);
    server.listen("udp", "127.0.0.1:0");

    let cancel = CancellationToken::new();
    let serving = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_with_cancel(cancel).await })
    };
    let addr = wait_for(Duration::from_secs(2), || {
        server
            .transport_layer()
            .local_addrs()
            .first()
            .map(|(_, addr)| *addr)
    })
    .await
    .expect("listener bound");

    Running {
        server,
        addr,
        cancel,
        serving,
        logs,
    }
}

fn request_from(peer: &UdpPeer, method: Method, branch: &str) -> Request {
    build_request(method, "sip:service@example.com", &peer.sent_by(), branch)
}

#[tokio::test]
async fn unregistered_method_gets_one_405_and_is_drained() {
    let running = start(|server| {
        server.on_options(|_req: Request, _tx: ServerTransaction| async {});
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();

    peer.send_request(&request_from(&peer, Method::Message, "z9hG4bK405a"), running.addr)
        .await
        .unwrap();
    let res = peer.recv_response(Duration::from_secs(2)).await.expect("405");
    assert_eq!(res.code(), 405);
    assert_eq!(res.headers().get("Allow").unwrap().as_str(), "OPTIONS");
    assert_eq!(res.headers().get("Server").unwrap().as_str(), "siphon");
    assert!(peer.recv(Duration::from_millis(200)).await.is_none(), "second response");

    // The transaction has no owner; the trying guard (64·T1) ends it and the
    // drain loop logs the timeout.
    let drained = wait_for(Duration::from_secs(3), || {
        (running.server.transaction_layer().server_transaction_count() == 0
            && running.logs.count("error from SIP server transaction") == 1)
            .then_some(())
    })
    .await;
    assert!(drained.is_some(), "logs:\n{}", running.logs.contents());
    assert_eq!(running.logs.count("SIP request handler not found"), 1);
    running.stop().await;
}

#[tokio::test]
async fn handler_runs_once_and_transaction_is_terminated_after_it() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let running = start(|server| {
        let calls = calls.clone();
        server.on_options(move |req: Request, tx: ServerTransaction| {
            let calls = calls.clone();
            let seen_tx = seen_tx.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = seen_tx.send((req, tx));
            }
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    let sent = request_from(&peer, Method::Options, "z9hG4bKonce");
    peer.send_request(&sent, running.addr).await.unwrap();

    let (req, tx) = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(req.headers().get("Call-ID"), sent.headers().get("Call-ID"));
    assert_eq!(tx.request().headers().get("Call-ID"), sent.headers().get("Call-ID"));

    tokio::time::timeout(Duration::from_secs(1), tx.done().cancelled())
        .await
        .expect("terminated right after the handler returned");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(running.server.transaction_layer().server_transaction_count(), 0);
    assert_eq!(running.logs.count("server transaction terminated by owner"), 1);
    running.stop().await;
}

#[tokio::test]
async fn terminate_after_handler_is_safe_when_handler_terminated() {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let running = start(|server| {
        server.on_message(move |_req: Request, tx: ServerTransaction| {
            let done_tx = done_tx.clone();
            async move {
                tx.terminate();
                let _ = done_tx.send(tx);
            }
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    peer.send_request(&request_from(&peer, Method::Message, "z9hG4bKself"), running.addr)
        .await
        .unwrap();

    let tx = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(tx.is_terminated());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(running.logs.count("server transaction terminated by owner"), 1);
    assert_eq!(tx.next_error().await, None);
    running.stop().await;
}

#[tokio::test]
async fn panicking_handler_still_terminates_its_transaction() {
    let running = start(|server| {
        server.on_options(|req: Request, _tx: ServerTransaction| async move {
            if req.method() == &Method::Options {
                panic!("handler failed");
            }
        });
        server.on_message(|req: Request, tx: ServerTransaction| async move {
            let _ = tx.respond(Response::from_request(&req, 200, "OK").unwrap()).await;
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    peer.send_request(&request_from(&peer, Method::Options, "z9hG4bKpanic"), running.addr)
        .await
        .unwrap();

    // Well inside the trying guard (64·T1 = 640ms here).
    let terminated = wait_for(Duration::from_millis(150), || {
        (running.logs.count("server transaction terminated by owner") == 1).then_some(())
    })
    .await;
    assert!(terminated.is_some(), "logs:\n{}", running.logs.contents());
    assert_eq!(running.server.transaction_layer().server_transaction_count(), 0);

    peer.send_request(&request_from(&peer, Method::Message, "z9hG4bKafter"), running.addr)
        .await
        .unwrap();
    let res = peer.recv_response(Duration::from_secs(2)).await.expect("200");
    assert_eq!(res.code(), 200);
    running.stop().await;
}

#[tokio::test]
async fn udp_and_tcp_listeners_dispatch_and_reject() {
    let logs = LogCapture::new();
    let server = new_server(&logs);
    server.on_options(|req: Request, tx: ServerTransaction| async move {
        let _ = tx.respond(Response::from_request(&req, 200, "OK").unwrap()).await;
    });
    server.listen("udp", "127.0.0.1:0");
    server.listen("tcp", "127.0.0.2:0");

    let cancel = CancellationToken::new();
    let serving = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_with_cancel(cancel).await })
    };
    let addr_of = |kind: TransportKind| {
        server
            .transport_layer()
            .local_addrs()
            .into_iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| addr)
    };
    let (udp_addr, tcp_addr) = wait_for(Duration::from_secs(2), || {
        Some((addr_of(TransportKind::Udp)?, addr_of(TransportKind::Tcp)?))
    })
    .await
    .expect("both listeners bound");
    assert_eq!(udp_addr.ip().to_string(), "127.0.0.1");
    assert_eq!(tcp_addr.ip().to_string(), "127.0.0.2");

    let udp = UdpPeer::bind().await.unwrap();
    udp.send_request(&request_from(&udp, Method::Options, "z9hG4bKudp"), udp_addr)
        .await
        .unwrap();
    let res = udp.recv_response(Duration::from_secs(2)).await.expect("udp 200");
    assert_eq!(res.code(), 200);

    let mut tcp = TcpPeer::connect(tcp_addr).await.unwrap();
    let options = build_request(Method::Options, "sip:service@example.com", &tcp.sent_by(), "z9hG4bKtcp1");
    tcp.send_request(&options).await.unwrap();
    let res = tcp.recv_response(Duration::from_secs(2)).await.expect("tcp 200");
    assert_eq!(res.code(), 200);
    assert_eq!(res.headers().top_via().unwrap().transport(), "TCP");

    let message = build_request(Method::Message, "sip:service@example.com", &tcp.sent_by(), "z9hG4bKtcp2");
    tcp.send_request(&message).await.unwrap();
    let res = tcp.recv_response(Duration::from_secs(2)).await.expect("tcp 405");
    assert_eq!(res.code(), 405);
    assert_eq!(res.headers().get("Allow").unwrap().as_str(), "OPTIONS");
    assert_eq!(res.headers().top_via().unwrap().branch(), Some("z9hG4bKtcp2"));

    assert_eq!(logs.count("listening (udp)"), 1);
    assert_eq!(logs.count("listening (tcp)"), 1);
    cancel.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_serve_while_serving_is_rejected() {
    let running = start(|_| {}).await;
    assert!(matches!(
        running.server.serve_with_cancel(CancellationToken::new()).await,
        Err(ServerError::AlreadyServing)
    ));
    assert_eq!(running.server.transport_layer().local_addrs().len(), 1);
    assert_eq!(running.logs.count("listening (udp)"), 1);
    running.stop().await;
}

#[tokio::test]
async fn invite_handler_responds_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx_out, mut tx_in) = mpsc::unbounded_channel();
    let running = start(|server| {
        let calls = calls.clone();
        server.on_invite(move |req: Request, tx: ServerTransaction| {
            let calls = calls.clone();
            let tx_out = tx_out.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let res = Response::from_request(&req, 200, "OK").unwrap();
                tx.respond(res).await.unwrap();
                let _ = tx_out.send(tx);
            }
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    peer.send_request(&request_from(&peer, Method::Invite, "z9hG4bKinv"), running.addr)
        .await
        .unwrap();

    let res = peer.recv_response(Duration::from_secs(2)).await.expect("200");
    assert_eq!(res.code(), 200);
    assert!(peer.recv(Duration::from_millis(300)).await.is_none(), "extra response");

    let tx = tx_in.recv().await.unwrap();
    assert!(tx.is_terminated());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(running.server.transaction_layer().server_transaction_count(), 0);
    running.stop().await;
}

#[tokio::test]
async fn request_observer_runs_before_handler() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let running = start(|server| {
        let observed = order.clone();
        server
            .serve_request(move |req| {
                observed.lock().unwrap().push(format!("observer {}", req.method()));
            })
            .unwrap();
        let handled = order.clone();
        server.on_options(move |req: Request, tx: ServerTransaction| {
            let handled = handled.clone();
            async move {
                handled.lock().unwrap().push(format!("handler {}", req.method()));
                let _ = tx.respond(Response::from_request(&req, 200, "OK").unwrap()).await;
            }
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    peer.send_request(&request_from(&peer, Method::Options, "z9hG4bKobs"), running.addr)
        .await
        .unwrap();
    peer.recv_response(Duration::from_secs(2)).await.expect("200");

    assert_eq!(
        *order.lock().unwrap(),
        vec!["observer OPTIONS".to_owned(), "handler OPTIONS".to_owned()]
    );
    running.stop().await;
}

#[tokio::test]
async fn response_observer_sees_unmatched_responses() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let running = start(|server| {
        server
            .serve_response(move |res| {
                let _ = seen_tx.send(res.code());
            })
            .unwrap();
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    peer.send(&response_as_bytes(&build_response(180, "Ringing")), running.addr)
        .await
        .unwrap();

    let code = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap();
    assert_eq!(code, Some(180));
    assert!(matches!(
        running.server.serve_response(|_| {}),
        Err(ServerError::ObserverAlreadyRegistered { .. })
    ));
    running.stop().await;
}

#[tokio::test]
async fn transaction_reply_removes_our_via() {
    let running = start(|server| {
        let weak: Weak<Server> = Arc::downgrade(server);
        server.on_bye(move |req: Request, tx: ServerTransaction| {
            let weak = weak.clone();
            async move {
                let Some(server) = weak.upgrade() else { return };
                let res = Response::from_request(&req, 200, "OK").unwrap();
                server.transaction_reply(&tx, res).await.unwrap();
            }
        });
    })
    .await;
    let peer = UdpPeer::bind().await.unwrap();
    let mut bye = request_from(&peer, Method::Bye, "z9hG4bKpeer");
    bye.headers_mut()
        .prepend("Via".into(), format!("SIP/2.0/UDP {ADVERTISED};branch=z9hG4bKours").into());
    peer.send_request(&bye, running.addr).await.unwrap();

    let res = peer.recv_response(Duration::from_secs(2)).await.expect("200");
    let vias = res.headers().vias();
    assert_eq!(vias.len(), 1);
    assert_eq!(vias[0].sent_by(), peer.sent_by());
    running.stop().await;
}

#[tokio::test]
async fn transaction_request_adds_via_and_record_route() {
    let running = start(|_| {}).await;
    let peer = UdpPeer::bind().await.unwrap();

    let mut req = build_request(Method::Options, "sip:peer@example.com", "10.10.10.10:5060", "z9hG4bKout");
    req.set_destination(peer.local_addr());
    let client = running.server.transaction_request(req).await.unwrap();

    let (msg, _) = peer.recv(Duration::from_secs(2)).await.expect("request");
    let SipMessage::Request(got) = msg else {
        panic!("expected a request");
    };
    let vias = got.headers().vias();
    assert_eq!(vias.len(), 2);
    assert_eq!(vias[0].sent_by(), ADVERTISED);
    assert_eq!(vias[1].sent_by(), "10.10.10.10:5060");
    assert_eq!(
        got.headers().get("Record-Route").unwrap().as_str(),
        "<sip:192.0.2.1:5060;transport=udp;lr>"
    );

    let ok = Response::from_request(&got, 200, "OK").unwrap();
    peer.send(&response_as_bytes(&ok), running.addr).await.unwrap();
    let res = tokio::time::timeout(Duration::from_secs(2), client.next_response())
        .await
        .unwrap()
        .expect("response");
    assert_eq!(res.code(), 200);
    running.stop().await;
}

#[tokio::test]
async fn write_request_rewrites_and_write_response_does_not() {
    let running = start(|_| {}).await;
    let peer = UdpPeer::bind().await.unwrap();

    let mut req = build_request(Method::Message, "sip:peer@example.com", "10.10.10.10:5060", "z9hG4bKsl");
    req.set_destination(peer.local_addr());
    running.server.write_request(req).await.unwrap();
    let (msg, _) = peer.recv(Duration::from_secs(2)).await.expect("request");
    assert_eq!(msg.headers().via_count(), 2);
    assert!(msg.headers().get("Record-Route").is_some());

    let mut res = build_response(200, "OK");
    res.headers_mut().remove_all("Via");
    res.headers_mut()
        .push("Via".into(), format!("SIP/2.0/UDP {ADVERTISED};branch=z9hG4bKsl").into());
    res.set_destination(peer.local_addr());
    running.server.write_response(res).await.unwrap();
    let got = peer.recv_response(Duration::from_secs(2)).await.expect("response");
    assert_eq!(got.headers().top_via().unwrap().sent_by(), ADVERTISED);
    running.stop().await;
}

#[tokio::test]
async fn write_errors_reach_the_caller() {
    let running = start(|_| {}).await;
    // sip:unresolvable.invalid has no address in the static resolver.
    let req = build_request(Method::Message, "sip:x@unresolvable.invalid", "10.0.0.1:5060", "z9hG4bKerr");
    let err = running.server.write_request(req).await.unwrap_err();
    assert!(matches!(err, ServerError::Write(_)));
    running.stop().await;
}

#[tokio::test]
async fn zero_listeners_block_until_cancelled_then_shut_down_once() {
    let logs = LogCapture::new();
    let server = new_server(&logs);
    let cancel = CancellationToken::new();
    let serving = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_with_cancel(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!serving.is_finished());
    assert!(!server.is_shut_down());

    cancel.cancel();
    serving.await.unwrap().unwrap();
    assert_eq!(logs.count("transaction layer closed"), 1);
    assert_eq!(logs.count("transport layer closed"), 1);
    assert!(logs.line_of("transaction layer closed") < logs.line_of("transport layer closed"));

    assert!(matches!(
        server.serve_with_cancel(CancellationToken::new()).await,
        Err(ServerError::ShutDown)
    ));
    assert_eq!(logs.count("server shut down"), 1);
}

#[tokio::test]
async fn construction_without_ip_uses_local_address() {
    let server = Server::new([with_dns_resolver(StaticResolver::default())]).unwrap();
    assert!(!server.host().is_empty());
    assert!(server.host().parse::<IpAddr>().is_ok());
    assert_eq!(server.port(), None);
}

#[tokio::test]
async fn construction_with_bad_address_fails() {
    let err = Server::new([with_ip("not-an-address.invalid:5060")]).unwrap_err();
    assert!(matches!(err, ServerError::Config(ConfigError::Resolve { .. })));

    let err = Server::new([with_ip("not-an-address.invalid")]).unwrap_err();
    assert!(matches!(err, ServerError::Config(ConfigError::InvalidAddress { .. })));
}
