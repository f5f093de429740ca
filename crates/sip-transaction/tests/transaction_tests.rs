// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sip_core::{Method, Request, Response, SipMessage};
use sip_dns::StaticResolver;
use sip_testkit::{build_ack_for, build_request, wait_for, UdpPeer};
use sip_transaction::{
    ServerTransaction, TimerConfig, TransactionError, TransactionLayer, TransactionUser,
};
use sip_transport::TransportLayer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ChannelUser(mpsc::UnboundedSender<(Request, ServerTransaction)>);

impl TransactionUser for ChannelUser {
    fn on_request(&self, req: Request, tx: ServerTransaction) {
        let _ = self.0.send((req, tx));
    }
}

struct Harness {
    layer: TransactionLayer,
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<(Request, ServerTransaction)>,
    peer: UdpPeer,
}

async fn harness() -> Harness {
    let transport = TransportLayer::new(Arc::new(StaticResolver::default()));
    let (tx, requests) = mpsc::unbounded_channel();
    let layer = TransactionLayer::with_timers(
        transport.clone(),
        Arc::new(ChannelUser(tx)),
        TimerConfig::scaled(Duration::from_millis(10)),
    );

    let serving = transport.clone();
    tokio::spawn(async move {
        serving
            .serve(CancellationToken::new(), "udp", "127.0.0.1:0")
            .await
    });
    let addr = wait_for(Duration::from_secs(2), || {
        transport.local_addrs().first().map(|(_, addr)| *addr)
    })
    .await
    .expect("listener started");

    Harness {
        layer,
        addr,
        requests,
        peer: UdpPeer::bind().await.unwrap(),
    }
}

async fn next_request(h: &mut Harness) -> (Request, ServerTransaction) {
    tokio::time::timeout(Duration::from_secs(2), h.requests.recv())
        .await
        .expect("request delivered")
        .expect("channel open")
}

#[tokio::test]
async fn retransmitted_request_replays_final_response() {
    let mut h = harness().await;
    let req = build_request(Method::Options, "sip:server@example.com", &h.peer.sent_by(), "z9hG4bKre1");
    h.peer.send_request(&req, h.addr).await.unwrap();

    let (got, tx) = next_request(&mut h).await;
    assert_eq!(got.method(), &Method::Options);
    assert_eq!(h.layer.server_transaction_count(), 1);

    tx.respond(Response::from_request(&got, 200, "OK").unwrap())
        .await
        .unwrap();
    assert_eq!(h.peer.recv_response(Duration::from_secs(2)).await.unwrap().code(), 200);

    h.peer.send_request(&req, h.addr).await.unwrap();
    assert_eq!(h.peer.recv_response(Duration::from_secs(2)).await.unwrap().code(), 200);
    assert!(h.requests.try_recv().is_err(), "retransmission reached the user");

    // Timer J = 64·T1 on UDP.
    tokio::time::timeout(Duration::from_secs(3), tx.done().cancelled())
        .await
        .expect("transaction terminated");
    assert_eq!(tx.next_error().await, None);
    h.layer.close();
}

#[tokio::test]
async fn ack_for_error_response_is_absorbed() {
    let mut h = harness().await;
    let invite = build_request(Method::Invite, "sip:bob@example.com", &h.peer.sent_by(), "z9hG4bKinv1");
    h.peer.send_request(&invite, h.addr).await.unwrap();

    let (got, tx) = next_request(&mut h).await;
    let busy = Response::from_request(&got, 486, "Busy Here").unwrap();
    tx.respond(busy.clone()).await.unwrap();
    assert_eq!(h.peer.recv_response(Duration::from_secs(2)).await.unwrap().code(), 486);

    h.peer.send_request(&build_ack_for(&invite, &busy), h.addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), tx.done().cancelled())
        .await
        .expect("terminated after Timer I");
    assert!(h.requests.try_recv().is_err(), "ACK reached the user");
    assert_eq!(h.layer.server_transaction_count(), 0);
    h.layer.close();
}

#[tokio::test]
async fn unmatched_ack_reaches_user_without_transaction() {
    let mut h = harness().await;
    let invite = build_request(Method::Invite, "sip:bob@example.com", &h.peer.sent_by(), "z9hG4bKstray");
    let ok = Response::from_request(&invite, 200, "OK").unwrap();
    h.peer.send_request(&build_ack_for(&invite, &ok), h.addr).await.unwrap();

    let (got, tx) = next_request(&mut h).await;
    assert_eq!(got.method(), &Method::Ack);
    assert!(tx.is_terminated());
    assert!(tx
        .respond(Response::from_request(&got, 200, "OK").unwrap())
        .await
        .is_err());
    h.layer.close();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mut h = harness().await;
    let req = build_request(Method::Message, "sip:bob@example.com", &h.peer.sent_by(), "z9hG4bKslow");
    h.peer.send_request(&req, h.addr).await.unwrap();

    let (_, tx) = next_request(&mut h).await;
    let err = tokio::time::timeout(Duration::from_secs(3), tx.next_error())
        .await
        .expect("timed out in time");
    assert_eq!(err, Some(TransactionError::Timeout { timer: "trying" }));
    assert!(tx.is_terminated());
    h.layer.close();
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let mut h = harness().await;
    let req = build_request(Method::Options, "sip:server@example.com", &h.peer.sent_by(), "z9hG4bKterm");
    h.peer.send_request(&req, h.addr).await.unwrap();

    let (got, tx) = next_request(&mut h).await;
    tx.terminate();
    tx.terminate();
    assert!(tx.is_terminated());
    assert_eq!(h.layer.server_transaction_count(), 0);
    assert!(tx
        .respond(Response::from_request(&got, 200, "OK").unwrap())
        .await
        .is_err());
    h.layer.close();
}

#[tokio::test]
async fn client_transaction_receives_response() {
    let h = harness().await;
    let mut req = build_request(Method::Options, "sip:peer@example.com", "127.0.0.1:1", "z9hG4bKcli1");
    req.set_destination(h.peer.local_addr());
    let tx = h.layer.request(req).await.unwrap();
    assert_eq!(h.layer.client_transaction_count(), 1);

    let (msg, from) = h.peer.recv(Duration::from_secs(2)).await.expect("request");
    assert_eq!(from, h.addr);
    let SipMessage::Request(sent) = msg else {
        panic!("expected request");
    };
    let ok = sip_parse::serialize_response(&Response::from_request(&sent, 200, "OK").unwrap());
    h.peer.send(&ok, h.addr).await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(2), tx.next_response())
        .await
        .expect("response in time")
        .expect("response");
    assert_eq!(res.code(), 200);
    h.layer.close();
}

#[tokio::test]
async fn client_request_rejects_ack_and_duplicates() {
    let h = harness().await;
    let mut req = build_request(Method::Options, "sip:peer@example.com", "127.0.0.1:1", "z9hG4bKdup");
    req.set_destination(h.peer.local_addr());
    let _first = h.layer.request(req.clone()).await.unwrap();
    assert!(h.layer.request(req).await.is_err());

    let ack = build_request(Method::Ack, "sip:peer@example.com", "127.0.0.1:1", "z9hG4bKack");
    assert!(h.layer.request(ack).await.is_err());
    h.layer.close();
}

#[tokio::test]
async fn close_terminates_live_transactions() {
    let mut h = harness().await;
    let req = build_request(Method::Options, "sip:server@example.com", &h.peer.sent_by(), "z9hG4bKclose");
    h.peer.send_request(&req, h.addr).await.unwrap();
    let (_, tx) = next_request(&mut h).await;

    h.layer.close();
    h.layer.close();
    assert!(h.layer.is_closed());
    assert!(tx.is_terminated());
    assert_eq!(tx.next_error().await, Some(TransactionError::Terminated));

    let mut late = build_request(Method::Options, "sip:x@example.com", "127.0.0.1:1", "z9hG4bKlate");
    late.set_destination(h.peer.local_addr());
    assert!(h.layer.request(late).await.is_err());
}
