// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S2: three sends issued back-to-back on the same connection hit the wire
//! in the order they were queued, and each reply is delivered to the
//! handler that sent the matching body.
//!
//! The "queued order" this asserts is the order `register_for_sending` runs
//! in, which here is also the order the three `start_single_node` calls
//! below are issued in. `SendQueue` itself guarantees FIFO draining once an
//! id is pushed; it does not control when each spawned request-on-connection
//! task gets scheduled to push. With a single-threaded caller driving all
//! three admissions before any of them yield, that ordering holds.

use std::sync::Arc;

use multiplex_rpc::{dispatch::ConnectionSet, request_set::RequestSet, roc::Payload, wire::Frame};

use crate::integration_tests::common::{FakeNode, dial, ok_reply, recv_frame, send_frame, wait_connected};

#[tokio::test]
async fn sends_hit_the_wire_in_queued_order() {
    let node = FakeNode::bind().await;
    let conn = dial(node.addr);
    let (mut reader, mut writer) = node.accept().await;
    wait_connected(&conn).await;

    let connections = Arc::new(ConnectionSet::new());
    connections.insert(conn.clone());
    let request_set = RequestSet::new(Arc::clone(&connections), 16);

    let mut replies = Vec::new();
    for body in ["a", "b", "c"] {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let body = body.to_string();
        request_set
            .start_single_node(
                conn.clone(),
                Arc::new(()),
                Arc::new(|_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {}),
                move |handle| async move {
                    let mut payload = Payload::new();
                    payload.add_bytes(body.as_bytes());
                    let reply = handle.send_and_receive(payload).await.expect("reply");
                    let _ = tx.lock().unwrap_or_else(|e| e.into_inner()).take().unwrap().send(reply);
                },
            )
            .expect("admitted");
        replies.push(rx);
    }

    // Node side: expect the three request frames in "a", "b", "c" order and
    // echo each body straight back.
    for expected in ["a", "b", "c"] {
        let frame = recv_frame(&mut reader).await;
        assert_eq!(&frame.body[..], expected.as_bytes());
        send_frame(&mut writer, Frame {
            msg_type: multiplex_rpc::wire::MessageType::Request,
            request_id: frame.request_id,
            body: ok_reply(expected.as_bytes()),
        })
        .await;
    }

    for (rx, expected) in replies.into_iter().zip(["a", "b", "c"]) {
        let reply = rx.await.expect("handler completed");
        assert_eq!(&reply[1..], expected.as_bytes());
    }
}
