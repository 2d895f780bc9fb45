// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S4: a node replying with the global `RequestNotSupported` status during
//! initialisation classifies as `InitOutcome::Unsupported` exactly once, and
//! never reaches the request's own handler loop.

use multiplex_rpc::{
    all_nodes::{InitOutcome, Initialiser, InitialiserLike, SharedWorking, UnsupportedKind},
    roc::RequestHandle,
};

use crate::integration_tests::common::{FakeNode, dial, recv_frame, send_frame, wait_connected};

#[tokio::test]
async fn request_not_supported_status_classifies_as_unsupported() {
    let node = FakeNode::bind().await;
    let conn = dial(node.addr);
    let (mut reader, mut writer) = node.accept().await;
    wait_connected(&conn).await;

    let request_id = multiplex_rpc::request_set::RequestId::from_wire(1).expect("nonzero");
    let handle = RequestHandle::new(request_id, conn);
    let working = SharedWorking::new();

    let initialiser = Initialiser::new(7, 1, |_payload| {});

    let node_side = tokio::spawn(async move {
        let frame = recv_frame(&mut reader).await;
        send_frame(&mut writer, multiplex_rpc::wire::Frame {
            msg_type: multiplex_rpc::wire::MessageType::Request,
            request_id: frame.request_id,
            body: bytes::Bytes::from_static(&[254]), // STATUS_REQUEST_NOT_SUPPORTED
        })
        .await;
    });

    let outcome = initialiser
        .initialise(&handle, &working)
        .await
        .expect("initialise completes");
    assert_eq!(
        outcome,
        InitOutcome::Unsupported(UnsupportedKind::RequestNotSupported)
    );

    node_side.await.expect("node task");
}
