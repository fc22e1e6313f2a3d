mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use relaychat_client::{
    ConnectOutcome, ConnectionState, Credentials, LocalPreviewHandle, MarkReadOutcome, MessageKey,
    OutgoingAttachment, SyncError,
};
use relaychat_shared::{ClientCommand, MessageStatus, ServerEvent, ValidationError};

fn new_message(msg: relaychat_shared::Message, is_pending: bool) -> ServerEvent {
    ServerEvent::NewMessage {
        timestamp: msg.created_at,
        message: msg,
        is_pending,
    }
}

async fn connected(api: Arc<MemoryApi>) -> Harness {
    let h = harness(api);
    assert_eq!(h.engine.connect().await.unwrap(), ConnectOutcome::Connected);
    // Let the event loop see the connected transition.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    h
}

#[tokio::test]
async fn hello_is_promoted_to_single_confirmed_record() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    let provisional = h.engine.send_message("R1", "Hello", None).await.unwrap();
    assert_eq!(provisional.content, "Hello");
    assert_eq!(provisional.status, MessageStatus::Sending);
    let temp_id = provisional.key.temp_id().unwrap().to_string();
    assert_eq!(h.engine.messages("R1"), vec![provisional]);

    let sent = h.server.received();
    assert!(sent.iter().any(|cmd| matches!(
        cmd,
        ClientCommand::SendMessage { content, temp_id: Some(t), company_id, .. }
            if content == "Hello" && *t == temp_id && company_id == "acme"
    )));

    h.server
        .push(new_message(message("m1", "R1", ME, "Hello", 1), false));
    eventually(|| h.engine.messages("R1")[0].key == MessageKey::Confirmed("m1".into())).await;

    let records = h.engine.messages("R1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, MessageStatus::Sent);
    assert_eq!(h.engine.pending_count(), 0);
    assert!(h.recorder.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn local_read_echo_flips_peer_messages() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(new_message(message("a", "R1", PEER, "one", 1), false));
    h.server.push(new_message(message("b", "R1", PEER, "two", 2), false));
    h.server.push(new_message(message("c", "R1", PEER, "later", 9), false));
    eventually(|| h.engine.messages("R1").len() == 3).await;
    assert_eq!(h.engine.room("R1").unwrap().unread_count, 3);
    assert_eq!(h.recorder.unopened.lock().unwrap().len(), 3);

    assert_eq!(h.engine.mark_as_read("R1").await, MarkReadOutcome::SentLive);
    assert!(h
        .server
        .received()
        .iter()
        .any(|cmd| matches!(cmd, ClientCommand::MarkAsRead { room_id, .. } if room_id == "R1")));

    h.server.push(ServerEvent::MessagesRead {
        room_id: "R1".to_string(),
        user_id: ME.to_string(),
        timestamp: at(5),
    });
    eventually(|| h.engine.room("R1").unwrap().unread_count == 0).await;

    let statuses: Vec<MessageStatus> = h.engine.messages("R1").iter().map(|m| m.status).collect();
    assert_eq!(
        statuses,
        vec![MessageStatus::Read, MessageStatus::Read, MessageStatus::Sent]
    );
}

#[tokio::test]
async fn same_message_twice_yields_one_record() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(new_message(message("m1", "R1", PEER, "hi", 1), false));
    h.server.push(new_message(message("m1", "R1", PEER, "hi", 1), false));
    h.server.push(new_message(message("m2", "R1", PEER, "marker", 2), false));
    eventually(|| h.engine.messages("R1").len() == 2).await;

    assert_eq!(h.engine.room("R1").unwrap().unread_count, 2);
}

#[tokio::test]
async fn queued_messages_are_ordered_by_creation_time() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(new_message(message("t2", "R1", PEER, "2", 2), true));
    h.server.push(new_message(message("t1", "R1", PEER, "1", 1), true));
    h.server.push(new_message(message("t3", "R1", PEER, "3", 3), true));
    eventually(|| h.engine.messages("R1").len() == 3).await;

    let ids: Vec<String> = h
        .engine
        .messages("R1")
        .iter()
        .filter_map(|m| m.key.id().map(str::to_string))
        .collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
}

#[tokio::test]
async fn offline_backlog_notifies_once_per_room() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0), room("R2", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(new_message(message("p1", "R1", PEER, "1", 1), true));
    h.server.push(new_message(message("p2", "R1", PEER, "2", 2), true));
    h.server.push(new_message(message("p3", "R2", PEER, "3", 3), true));
    h.server.push(new_message(message("p4", "R1", PEER, "4", 4), true));
    eventually(|| h.engine.messages("R1").len() == 3 && h.engine.messages("R2").len() == 1).await;

    assert_eq!(h.engine.room("R1").unwrap().unread_count, 3);
    assert_eq!(*h.recorder.unopened.lock().unwrap(), vec!["R1", "R2"]);

    h.server.push(new_message(message("live", "R1", PEER, "5", 5), false));
    eventually(|| h.engine.messages("R1").len() == 4).await;
    assert_eq!(*h.recorder.unopened.lock().unwrap(), vec!["R1", "R2", "R1"]);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_send_rolls_back_at_deadline() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    let lost = h.engine.send_message("R1", "lost", None).await.unwrap();
    h.engine.send_message("R1", "kept", None).await.unwrap();

    tokio::time::advance(Duration::from_millis(9_999)).await;
    assert_eq!(h.engine.messages("R1").len(), 2);

    // Confirmed just before the deadline: never rolled back.
    h.server.push(new_message(message("m-kept", "R1", ME, "kept", 1), false));
    eventually(|| {
        h.engine
            .messages("R1")
            .iter()
            .any(|m| m.key.id() == Some("m-kept"))
    })
    .await;

    tokio::time::advance(Duration::from_millis(10)).await;
    eventually(|| h.recorder.failures.lock().unwrap().len() == 1).await;

    let failures = h.recorder.failures.lock().unwrap().clone();
    assert_eq!(failures[0].0, lost.key.temp_id().unwrap());
    assert_eq!(failures[0].1, SyncError::SendTimeout);

    let records = h.engine.messages("R1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.id(), Some("m-kept"));
    assert_eq!(h.engine.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_mark_as_read_transmits_once() {
    // Offline, so receipts go through REST.
    let h = harness(MemoryApi::with_rooms(vec![room("R1", 4)]));
    h.engine.load_rooms(false).await.unwrap();

    let (first, second) = tokio::join!(h.engine.mark_as_read("R1"), h.engine.mark_as_read("R1"));

    assert_eq!(first, MarkReadOutcome::SentRest);
    assert_eq!(second, MarkReadOutcome::AlreadyInFlight);
    assert_eq!(h.api.mark_read_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mark_as_read_without_unread_is_noop() {
    let h = harness(MemoryApi::with_rooms(vec![room("R1", 0)]));
    h.engine.load_rooms(false).await.unwrap();

    assert_eq!(h.engine.mark_as_read("R1").await, MarkReadOutcome::NothingUnread);
    assert_eq!(h.api.mark_read_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn attachments_go_through_rest_even_when_connected() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let preview = LocalPreviewHandle::new("blob:photo", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let file = OutgoingAttachment::new("photo.png", "image/png", vec![0u8; 64]).with_preview(preview);

    let confirmed = h.engine.send_message("R1", "", Some(file)).await.unwrap();

    assert_eq!(confirmed.key.id(), Some("srv-0"));
    assert_eq!(h.api.sends.lock().unwrap()[0].2.as_deref(), Some("photo.png"));
    assert!(!h
        .server
        .received()
        .iter()
        .any(|cmd| matches!(cmd, ClientCommand::SendMessage { .. })));
    assert_eq!(h.engine.messages("R1").len(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn offline_text_send_uses_rest() {
    let h = harness(MemoryApi::with_rooms(vec![room("R1", 0)]));
    h.engine.load_rooms(false).await.unwrap();

    let confirmed = h.engine.send_message("R1", "via rest", None).await.unwrap();
    assert_eq!(confirmed.status, MessageStatus::Sent);
    let records = h.engine.messages("R1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.id(), Some("srv-0"));
    assert_eq!(h.engine.room("R1").unwrap().last_message.unwrap().id, "srv-0");
}

#[tokio::test]
async fn failed_send_rolls_back_and_reports() {
    let api = MemoryApi::with_rooms(vec![room("R1", 0)]);
    api.fail_writes.store(true, Ordering::SeqCst);
    let h = harness(api);
    h.engine.load_rooms(false).await.unwrap();

    let err = h.engine.send_message("R1", "nope", None).await.unwrap_err();

    assert!(matches!(err, SyncError::Api(_)));
    assert_eq!(err.user_message(), "try again later");
    assert!(h.engine.messages("R1").is_empty());
    assert_eq!(h.recorder.failures.lock().unwrap().len(), 1);
    assert_eq!(h.engine.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rest_send_outliving_deadline_fails_exactly_once() {
    let api = MemoryApi::with_rooms(vec![room("R1", 0)]);
    *api.send_latency.lock().unwrap() = Some(Duration::from_secs(11));
    let h = harness(api);
    h.engine.load_rooms(false).await.unwrap();

    let err = h.engine.send_message("R1", "slow", None).await.unwrap_err();
    assert_eq!(err, SyncError::SendTimeout);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let failures = h.recorder.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, SyncError::SendTimeout);
    assert!(h.engine.messages("R1").is_empty());
    assert_eq!(h.engine.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_rest_send_inside_deadline_is_confirmed() {
    let api = MemoryApi::with_rooms(vec![room("R1", 0)]);
    *api.send_latency.lock().unwrap() = Some(Duration::from_secs(9));
    let h = harness(api);
    h.engine.load_rooms(false).await.unwrap();

    let confirmed = h.engine.send_message("R1", "slow", None).await.unwrap();
    assert_eq!(confirmed.key.id(), Some("srv-0"));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.recorder.failures.lock().unwrap().is_empty());
    let records = h.engine.messages("R1");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.id(), Some("srv-0"));
}

#[tokio::test]
async fn invalid_messages_never_reach_the_store() {
    let h = harness(MemoryApi::with_rooms(vec![room("R1", 0)]));

    let err = h.engine.send_message("R1", "   ", None).await.unwrap_err();
    assert_eq!(err, SyncError::Validation(ValidationError::EmptyMessage));

    let file = OutgoingAttachment::new("run.exe", "application/x-msdownload", vec![1]);
    let err = h.engine.send_message("R1", "", Some(file)).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::UnsupportedAttachmentType(_))
    ));
    assert!(h.engine.messages("R1").is_empty());
}

#[tokio::test]
async fn failed_edit_and_delete_are_reverted() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();
    h.server.push(new_message(message("m1", "R1", ME, "original", 1), false));
    eventually(|| h.engine.messages("R1").len() == 1).await;

    h.api.fail_writes.store(true, Ordering::SeqCst);
    assert!(h.engine.edit_message("R1", "m1", "changed").await.is_err());
    assert_eq!(h.engine.messages("R1")[0].content, "original");

    assert!(h.engine.delete_message("R1", "m1").await.is_err());
    assert_eq!(h.engine.messages("R1").len(), 1);

    h.api.fail_writes.store(false, Ordering::SeqCst);
    h.engine.edit_message("R1", "m1", "changed").await.unwrap();
    assert_eq!(h.engine.messages("R1")[0].content, "changed");
    assert!(h.engine.messages("R1")[0].edited_at.is_some());

    h.engine.delete_message("R1", "m1").await.unwrap();
    assert!(h.engine.messages("R1").is_empty());
    assert_eq!(
        h.engine.delete_message("R1", "m1").await,
        Err(SyncError::UnknownMessage("m1".to_string()))
    );
}

#[tokio::test]
async fn message_for_unknown_room_fetches_and_joins_it() {
    let api = MemoryApi::with_rooms(vec![room("R9", 1)]);
    let h = connected(api).await;

    h.server.push(new_message(message("x1", "R9", PEER, "hey", 1), false));
    eventually(|| h.engine.room("R9").is_some()).await;
    eventually(|| h.engine.is_joined("R9")).await;

    assert_eq!(h.engine.messages("R9").len(), 1);
    assert_eq!(h.engine.room("R9").unwrap().last_message.unwrap().id, "x1");
    assert!(h
        .server
        .received()
        .iter()
        .any(|cmd| matches!(cmd, ClientCommand::JoinRoom { room_id, .. } if room_id == "R9")));
}

#[tokio::test]
async fn message_in_foreground_room_is_marked_read() {
    let api = MemoryApi::with_rooms(vec![room("R1", 0)]);
    let h = harness_with_focus(api, Some(Arc::new(Focused("R1"))));
    h.engine.connect().await.unwrap();
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(new_message(message("m1", "R1", PEER, "look", 1), false));
    eventually(|| {
        h.server
            .received()
            .iter()
            .any(|cmd| matches!(cmd, ClientCommand::MarkAsRead { .. }))
    })
    .await;

    assert!(h.recorder.unopened.lock().unwrap().is_empty());
    assert_eq!(h.engine.room("R1").unwrap().unread_count, 0);
}

#[tokio::test]
async fn history_merges_with_live_messages() {
    let api = MemoryApi::with_rooms(vec![room("R1", 0)]);
    api.history.lock().unwrap().insert(
        "R1".to_string(),
        vec![
            message("h1", "R1", PEER, "old", 1),
            message("h2", "R1", PEER, "older live", 2),
        ],
    );
    let h = connected(api).await;
    h.engine.load_rooms(false).await.unwrap();
    h.server.push(new_message(message("h2", "R1", PEER, "older live", 2), false));
    eventually(|| h.engine.messages("R1").len() == 1).await;

    assert_eq!(h.engine.load_history("R1", 0).await.unwrap(), 1);
    let ids: Vec<String> = h
        .engine
        .messages("R1")
        .iter()
        .filter_map(|m| m.key.id().map(str::to_string))
        .collect();
    assert_eq!(ids, vec!["h1", "h2"]);
}

#[tokio::test]
async fn rooms_list_is_served_from_cache_until_forced() {
    let h = harness(MemoryApi::with_rooms(vec![room("R1", 0), room("R2", 0)]));

    assert_eq!(h.engine.load_rooms(false).await.unwrap().len(), 2);
    h.engine.load_rooms(false).await.unwrap();
    assert_eq!(h.api.fetch_rooms_calls.load(Ordering::SeqCst), 1);

    h.engine.load_rooms(true).await.unwrap();
    assert_eq!(h.api.fetch_rooms_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn room_events_update_rooms_and_participants() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();

    h.server.push(ServerEvent::ParticipantAdded {
        room_id: "R1".to_string(),
        user_id: PEER.to_string(),
        user_name: "Ana".to_string(),
        is_admin: false,
        timestamp: at(1),
    });
    h.server.push(ServerEvent::ParticipantPromoted {
        room_id: "R1".to_string(),
        user_id: PEER.to_string(),
        timestamp: at(2),
    });
    h.server.push(ServerEvent::RoomUpdated {
        room_id: "R1".to_string(),
        name: Some("renamed".to_string()),
        image_url: None,
        timestamp: at(3),
    });
    h.server.push(ServerEvent::ParticipantLeft {
        room_id: "R1".to_string(),
        user_id: PEER.to_string(),
        user_name: "Ana".to_string(),
        timestamp: at(4),
    });
    eventually(|| {
        h.engine
            .room("R1")
            .and_then(|r| r.participant(PEER).cloned())
            .is_some_and(|p| !p.is_active)
    })
    .await;

    let room = h.engine.room("R1").unwrap();
    assert_eq!(room.name.as_deref(), Some("renamed"));
    let participant = room.participant(PEER).unwrap();
    assert!(participant.is_admin);
    assert_eq!(participant.left_at, Some(at(4)));
}

#[tokio::test]
async fn server_error_event_reaches_observer() {
    let h = connected(MemoryApi::new()).await;
    h.server.push(ServerEvent::Error {
        message: "forbidden".to_string(),
    });
    eventually(|| h.recorder.errors.lock().unwrap().len() == 1).await;
}

#[tokio::test]
async fn connect_without_tenant_fails_fast() {
    let server = MemoryServer::new();
    let engine = relaychat_client::ChatEngine::builder(
        ME,
        Credentials {
            company_id: Some("  ".to_string()),
            ..credentials()
        },
    )
    .connector(server.clone())
    .api(MemoryApi::new())
    .build();

    assert_eq!(engine.connect().await, Err(SyncError::MissingTenant));
    assert_eq!(server.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_link_reconnects_and_rejoins_rooms() {
    let h = connected(MemoryApi::with_rooms(vec![room("R1", 0)])).await;
    h.engine.load_rooms(false).await.unwrap();
    let joins = |h: &Harness| {
        h.server
            .received()
            .iter()
            .filter(|cmd| matches!(cmd, ClientCommand::JoinRoom { room_id, .. } if room_id == "R1"))
            .count()
    };
    let before = joins(&h);
    assert!(before >= 1);

    h.server.drop_link();
    eventually(|| h.engine.connection_status().state == ConnectionState::Disconnected).await;

    tokio::time::advance(Duration::from_secs(1)).await;
    eventually(|| h.engine.connection_status().state == ConnectionState::Connected).await;
    eventually(|| joins(&h) == before + 1).await;
    assert_eq!(h.server.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn server_requested_disconnect_does_not_reconnect() {
    let h = connected(MemoryApi::new()).await;

    h.server.push(ServerEvent::Disconnect {
        reason: "io server disconnect".to_string(),
    });
    h.server.drop_link();
    eventually(|| h.engine.connection_status().state == ConnectionState::Disconnected).await;

    tokio::time::advance(Duration::from_secs(30)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.server.opens.load(Ordering::SeqCst), 1);
}
