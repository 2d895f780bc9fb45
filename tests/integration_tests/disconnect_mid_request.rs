// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S3: a connection lost while a request-on-connection is waiting for a
//! reply notifies `all_finished_notifier` exactly once, with no other
//! notification, and a subsequent request on a fresh connection still works.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use multiplex_rpc::{dispatch::ConnectionSet, request_set::RequestSet, roc::Payload};

use crate::integration_tests::common::{FakeNode, dial, recv_frame, wait_connected};

#[tokio::test]
async fn connection_loss_notifies_the_request_exactly_once() {
    let node = FakeNode::bind().await;
    let conn = dial(node.addr);
    let (mut reader, writer) = node.accept().await;
    wait_connected(&conn).await;

    let connections = Arc::new(ConnectionSet::new());
    connections.insert(conn.clone());
    let request_set = RequestSet::new(Arc::clone(&connections), 16);

    let finished = Arc::new(AtomicUsize::new(0));
    let finished2 = Arc::clone(&finished);
    let (err_tx, err_rx) = tokio::sync::oneshot::channel();
    let err_tx = std::sync::Mutex::new(Some(err_tx));

    let assignment = request_set
        .start_single_node(
            conn.clone(),
            Arc::new(()),
            Arc::new(move |_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
            move |handle| async move {
                let mut payload = Payload::new();
                payload.add_bytes(b"ping");
                let result = handle.send_and_receive(payload).await;
                let _ = err_tx.lock().unwrap_or_else(|e| e.into_inner()).take().unwrap().send(result.is_err());
            },
        )
        .expect("admitted");

    let _frame = recv_frame(&mut reader).await;

    // Kill the node side of the socket without replying.
    drop(reader);
    drop(writer);

    let saw_error = err_rx.await.expect("handler completed");
    assert!(saw_error, "request must fail once its connection drops");

    for _ in 0..50 {
        if finished.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        finished.load(Ordering::SeqCst),
        1,
        "all_finished_notifier must fire exactly once"
    );
    request_set.forget(assignment.id);

    // A fresh connection to a fresh node still works.
    let node2 = FakeNode::bind().await;
    let conn2 = dial(node2.addr);
    let (mut reader2, mut writer2) = node2.accept().await;
    wait_connected(&conn2).await;
    connections.insert(conn2.clone());

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    request_set
        .start_single_node(
            conn2,
            Arc::new(()),
            Arc::new(|_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {}),
            move |handle| async move {
                let mut payload = Payload::new();
                payload.add_bytes(b"hello-again");
                let reply = handle.send_and_receive(payload).await.expect("reply");
                let _ = done_tx.lock().unwrap_or_else(|e| e.into_inner()).take().unwrap().send(reply);
            },
        )
        .expect("admitted");

    let frame = recv_frame(&mut reader2).await;
    assert_eq!(&frame.body[..], b"hello-again");
    futures::SinkExt::send(&mut writer2, multiplex_rpc::wire::Frame {
        msg_type: multiplex_rpc::wire::MessageType::Request,
        request_id: frame.request_id,
        body: bytes::Bytes::from_static(b"\x00hello-again"),
    })
    .await
    .expect("send reply");

    let reply = done_rx.await.expect("handler completed");
    assert_eq!(&reply[..], b"\x00hello-again");
}
