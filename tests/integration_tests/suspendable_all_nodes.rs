// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S5/S6/S7: the suspend/resume/stop control protocol round-trips through
//! every connection of an all-nodes request exactly once per state change,
//! a controller call made from inside the request's own notifier is honored
//! (S6), and a `SuspendableInitialiser` that finds the request already
//! stopped aborts without sending anything (S7).

use std::{
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use multiplex_rpc::{
    all_nodes::{
        self, AllNodesHandler, InitOutcome, Initialiser, InitialiserLike, SharedWorking,
        SuspendableInitialiser,
    },
    connection::ConnectionHandle,
    controller::{ControlMessage, DesiredState, SuspendableController, SuspendableShared},
    dispatch::ConnectionSet,
    error::RocError,
    request_set::{RequestId, RequestSet},
    roc::RequestHandle,
    wire::{Frame, MessageType},
};
use tokio::sync::mpsc;

use crate::integration_tests::common::{FakeNode, dial, recv_frame, send_frame, wait_connected};

type HandlerFut = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

struct NoopHandler;

#[async_trait]
impl AllNodesHandler for NoopHandler {
    async fn on_message(&self, _body: Bytes) -> Result<bool, RocError> {
        Ok(true)
    }
}

#[tokio::test]
async fn suspend_then_resume_then_stop_round_trips_through_every_connection() {
    let node_a = FakeNode::bind().await;
    let node_b = FakeNode::bind().await;
    let conn_a = dial(node_a.addr);
    let conn_b = dial(node_b.addr);
    let (mut reader_a, mut writer_a) = node_a.accept().await;
    let (mut reader_b, mut writer_b) = node_b.accept().await;
    wait_connected(&conn_a).await;
    wait_connected(&conn_b).await;

    let connections = Arc::new(ConnectionSet::new());
    connections.insert(conn_a);
    connections.insert(conn_b);
    let request_set = RequestSet::new(Arc::clone(&connections), 16);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<DesiredState>();
    let controller_cell: Arc<OnceLock<(Arc<RequestSet>, RequestId, Arc<()>)>> = Arc::new(OnceLock::new());
    let controller_cell2 = Arc::clone(&controller_cell);

    let shared = Arc::new(SuspendableShared::new(DesiredState::Running, move |state| {
        let _ = events_tx.send(state);
        // S6: the request's own notifier is allowed to call straight back
        // into its controller.
        if state == DesiredState::Suspended {
            if let Some((rs, id, marker)) = controller_cell2.get() {
                let controller = SuspendableController::new(rs.as_ref(), *id, Arc::clone(marker));
                let _ = controller.resume();
            }
        }
    }));

    let working = Arc::new(SharedWorking::new());

    let handler_for = {
        let working = Arc::clone(&working);
        let shared = Arc::clone(&shared);
        move |_conn: ConnectionHandle| {
            let working = Arc::clone(&working);
            let shared = Arc::clone(&shared);
            Box::new(move |handle: RequestHandle| -> HandlerFut {
                Box::pin(async move {
                    all_nodes::run(
                        handle,
                        &working,
                        || SuspendableInitialiser::new(Initialiser::new(7, 1, |_p| {}), &shared),
                        NoopHandler,
                        Some(&shared),
                        |_e| {},
                        |_kind, _addr| {},
                    )
                    .await;
                })
            }) as Box<dyn FnOnce(RequestHandle) -> HandlerFut + Send>
        }
    };

    let finished = Arc::new(AtomicUsize::new(0));
    let finished2 = Arc::clone(&finished);
    let assignment = request_set
        .start_all_nodes(
            Arc::clone(&shared) as Arc<dyn std::any::Any + Send + Sync>,
            Arc::new(move |_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
            handler_for,
        )
        .expect("admitted");

    controller_cell
        .set((Arc::clone(&request_set), assignment.id, Arc::clone(&assignment.marker)))
        .ok()
        .expect("set exactly once");

    // Drive both nodes through the initial handshake: any status byte other
    // than the two reserved "unsupported" codes classifies as `Ready`.
    for (reader, writer) in [(&mut reader_a, &mut writer_a), (&mut reader_b, &mut writer_b)] {
        let frame = recv_frame(reader).await;
        send_frame(writer, Frame {
            msg_type: MessageType::Request,
            request_id: frame.request_id,
            body: Bytes::from_static(&[0]),
        })
        .await;
    }

    // Wait for both request-on-connections to have entered their receive
    // wait, and let the scheduler catch up so their wake slots are armed.
    for _ in 0..500 {
        if shared.ready_for_state_change() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(shared.ready_for_state_change(), 2);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    let controller = SuspendableController::new(request_set.as_ref(), assignment.id, Arc::clone(&assignment.marker));
    assert!(controller.suspend().expect("suspend accepted"));

    for (reader, writer) in [(&mut reader_a, &mut writer_a), (&mut reader_b, &mut writer_b)] {
        let frame = recv_frame(reader).await;
        assert_eq!(frame.body[0], ControlMessage::Suspend as u8);
        send_frame(writer, Frame {
            msg_type: MessageType::Request,
            request_id: frame.request_id,
            body: Bytes::from_static(&[ControlMessage::Ack as u8]),
        })
        .await;
    }
    assert_eq!(events_rx.recv().await, Some(DesiredState::Suspended));

    // The notifier above already called `resume()` on our behalf; expect the
    // matching Resume/Ack exchange without the test driving it directly.
    for (reader, writer) in [(&mut reader_a, &mut writer_a), (&mut reader_b, &mut writer_b)] {
        let frame = recv_frame(reader).await;
        assert_eq!(frame.body[0], ControlMessage::Resume as u8);
        send_frame(writer, Frame {
            msg_type: MessageType::Request,
            request_id: frame.request_id,
            body: Bytes::from_static(&[ControlMessage::Ack as u8]),
        })
        .await;
    }
    assert_eq!(events_rx.recv().await, Some(DesiredState::Running));

    assert!(controller.stop().expect("stop accepted"));
    for (reader, writer) in [(&mut reader_a, &mut writer_a), (&mut reader_b, &mut writer_b)] {
        let frame = recv_frame(reader).await;
        assert_eq!(frame.body[0], ControlMessage::Stop as u8);
        send_frame(writer, Frame {
            msg_type: MessageType::Request,
            request_id: frame.request_id,
            body: Bytes::from_static(&[ControlMessage::Ack as u8]),
        })
        .await;
    }
    assert_eq!(events_rx.recv().await, Some(DesiredState::Stopped));

    for _ in 0..200 {
        if finished.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        finished.load(Ordering::SeqCst),
        1,
        "all_finished_notifier must fire exactly once once both RoCs stop"
    );
    request_set.forget(assignment.id);
    assert!(request_set.is_empty());
}

#[tokio::test]
async fn suspendable_initialiser_aborts_without_sending_once_already_stopped() {
    let node = FakeNode::bind().await;
    let conn = dial(node.addr);
    let (_reader, _writer) = node.accept().await;
    wait_connected(&conn).await;

    let request_id = RequestId::from_wire(1).expect("nonzero");
    let handle = RequestHandle::new(request_id, conn);
    let working = SharedWorking::new();
    let shared = SuspendableShared::new(DesiredState::Stopped, |_| {});

    let initialiser = SuspendableInitialiser::new(Initialiser::new(7, 1, |_payload| {}), &shared);

    let outcome = initialiser
        .initialise(&handle, &working)
        .await
        .expect("initialise completes");
    assert_eq!(outcome, InitOutcome::Aborted);
    assert_eq!(
        shared.ready_for_state_change(),
        0,
        "an aborted initialisation never marks its request-on-connection ready"
    );
}
