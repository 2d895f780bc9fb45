// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S1: a single-node request round-trips exactly once and leaves the
//! request set empty afterwards.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use multiplex_rpc::{
    dispatch::ConnectionSet, request_set::RequestSet, roc::Payload, wire::Frame,
};

use crate::integration_tests::common::{
    FakeNode, dial, ok_reply, recv_frame, send_frame, wait_connected,
};

#[tokio::test]
async fn echo_round_trips_once_and_clears_the_request_set() {
    let node = FakeNode::bind().await;
    let conn = dial(node.addr);
    let (mut reader, mut writer) = node.accept().await;
    wait_connected(&conn).await;

    let connections = Arc::new(ConnectionSet::new());
    connections.insert(conn.clone());
    let request_set = RequestSet::new(Arc::clone(&connections), 16);

    let finished = Arc::new(AtomicUsize::new(0));
    let finished2 = Arc::clone(&finished);
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = std::sync::Mutex::new(Some(done_tx));

    let assignment = request_set
        .start_single_node(
            conn,
            Arc::new(()),
            Arc::new(move |_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
            move |handle| async move {
                let mut payload = Payload::new();
                payload.add_bytes(b"hello");
                let reply = handle.send_and_receive(payload).await.expect("reply");
                let _ = done_tx
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .expect("single use")
                    .send(reply);
            },
        )
        .expect("admitted");

    let frame = recv_frame(&mut reader).await;
    assert_eq!(frame.request_id, assignment.id.get());
    assert_eq!(&frame.body[..], b"hello");

    send_frame(&mut writer, Frame {
        msg_type: multiplex_rpc::wire::MessageType::Request,
        request_id: frame.request_id,
        body: ok_reply(b"hello"),
    })
    .await;

    let reply = done_rx.await.expect("handler completed");
    assert_eq!(&reply[..], b"\x00hello");

    for _ in 0..50 {
        if finished.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    request_set.forget(assignment.id);
    assert!(request_set.is_empty());
}
