//! End-to-end scenarios driven through the service, the hub, and the
//! ratchet engine together.

use std::sync::Arc;

use sonet_hub::hub::InboundHandler;
use sonet_hub::HubError;
use sonet_proto::api::*;
use sonet_proto::events::{EventKind, WireEvent};
use sonet_proto::presence::ConnectionStatus;
use sonet_proto::{ChatKind, GroupSizeStatus, MessageStatus};
use sonet_server::config::ServerConfig;
use sonet_server::{MessagingCore, MessagingService};

async fn service() -> MessagingService {
    let core = MessagingCore::build(ServerConfig::default()).await.expect("core builds");
    MessagingService::new(core)
}

fn send_req(chat_id: &str, sender: &str, content: &str) -> SendMessageRequest {
    SendMessageRequest {
        chat_id: chat_id.to_string(),
        sender_id: sender.to_string(),
        content: content.to_string(),
        message_type: sonet_proto::MessageType::Text,
        reply_to_message_id: None,
        thread_id: None,
    }
}

async fn create_direct(service: &MessagingService, a: &str, b: &str) -> String {
    let resp = service
        .create_chat(CreateChatRequest {
            kind: ChatKind::Direct,
            creator_id: a.to_string(),
            participant_ids: vec![a.to_string(), b.to_string()],
            name: None,
        })
        .await;
    assert!(resp.status.is_ok(), "create failed: {}", resp.status.message);
    resp.chat.unwrap().chat_id
}

/// Pull events until one of the wanted kind arrives, skipping presence and
/// typing noise.
fn next_of_kind(
    rx: &mut tokio::sync::mpsc::Receiver<WireEvent>,
    kind: EventKind,
) -> Option<WireEvent> {
    while let Ok(event) = rx.try_recv() {
        if event.kind == kind {
            return Some(event);
        }
    }
    None
}

#[tokio::test]
async fn direct_encrypted_send() {
    let service = service().await;
    let hub = service.core().hub.clone();
    let chat_id = create_direct(&service, "alice", "bob").await;

    let (bob_conn, mut bob_rx) = hub.open_connection();
    hub.authenticate(&bob_conn.connection_id, "bob", "tok", "phone").await.unwrap();

    let resp = service.send_message(send_req(&chat_id, "alice", "hello")).await;
    assert!(resp.status.is_ok());
    let sent = resp.message.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    let descriptor = sent.encryption.as_ref().expect("descriptor present");
    assert!(!descriptor.key_id.is_empty());
    assert!(!descriptor.nonce.is_empty());
    assert!(!descriptor.signature.is_empty());
    assert!(descriptor.perfect_forward_secrecy);

    // Bob's stream got exactly one NEW_MESSAGE with the plaintext.
    let event = next_of_kind(&mut bob_rx, EventKind::NewMessage).expect("delivered");
    assert_eq!(event.data["message"]["content"], "hello");
    assert!(next_of_kind(&mut bob_rx, EventKind::NewMessage).is_none());

    // Exactly one message in the store.
    let page = service
        .get_messages(GetMessagesRequest {
            chat_id: chat_id.clone(),
            requester_id: "alice".into(),
            cursor: None,
            limit: None,
        })
        .await;
    assert!(page.status.is_ok());
    assert_eq!(page.messages.len(), 1);

    // Bob's receiving chain advanced by one.
    assert_eq!(service.core().engine.receiving_number(&chat_id, "bob").unwrap(), 1);
}

#[tokio::test]
async fn out_of_order_delivery_drains_skipped_keys() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;
    let engine = &service.core().engine;

    let (e1, _) = engine.encrypt(&chat_id, "alice", b"m1").unwrap();
    let (e2, _) = engine.encrypt(&chat_id, "alice", b"m2").unwrap();
    let (e3, _) = engine.encrypt(&chat_id, "alice", b"m3").unwrap();

    assert_eq!(engine.decrypt(&chat_id, "bob", &e1).unwrap(), b"m1");
    assert_eq!(engine.decrypt(&chat_id, "bob", &e3).unwrap(), b"m3");
    assert_eq!(engine.decrypt(&chat_id, "bob", &e2).unwrap(), b"m2");
    assert_eq!(engine.skipped_key_count(&chat_id, "bob").unwrap(), 0);
}

#[tokio::test]
async fn group_fan_out() {
    const MEMBERS: usize = 300;
    let service = service().await;
    let hub = service.core().hub.clone();

    let participants: Vec<String> = (0..MEMBERS).map(|i| format!("u{i}")).collect();
    let resp = service
        .create_chat(CreateChatRequest {
            kind: ChatKind::Group,
            creator_id: "u0".into(),
            participant_ids: participants.clone(),
            name: Some("big room".into()),
        })
        .await;
    assert!(resp.status.is_ok());
    let chat_id = resp.chat.unwrap().chat_id;

    // One connection per member, plus a second device for the sender.
    let mut receivers = Vec::new();
    for user in &participants {
        let (conn, rx) = hub.open_connection();
        hub.authenticate(&conn.connection_id, user, "tok", "dev-1").await.unwrap();
        receivers.push((user.clone(), rx));
    }
    let (sender_second, rx_second) = hub.open_connection();
    hub.authenticate(&sender_second.connection_id, "u5", "tok", "dev-2").await.unwrap();
    receivers.push(("u5#2".into(), rx_second));

    // Presence noise from 301 logins can fill the bounded queues; drain it
    // so the message event finds room everywhere.
    for (_, rx) in receivers.iter_mut() {
        while rx.try_recv().is_ok() {}
    }

    let resp = service.send_message(send_req(&chat_id, "u5", "gm")).await;
    assert!(resp.status.is_ok());

    for (who, rx) in receivers.iter_mut() {
        let event = next_of_kind(rx, EventKind::NewMessage)
            .unwrap_or_else(|| panic!("{who} missed the event"));
        assert_eq!(event.data["message"]["content"], "gm");
    }
}

#[tokio::test]
async fn group_over_limit() {
    let service = service().await;

    let participants: Vec<String> = (0..500).map(|i| format!("u{i}")).collect();
    let resp = service
        .create_chat(CreateChatRequest {
            kind: ChatKind::Group,
            creator_id: "u0".into(),
            participant_ids: participants,
            name: None,
        })
        .await;
    assert!(resp.status.is_ok());
    let chat_id = resp.chat.unwrap().chat_id;
    assert_eq!(
        service.group_size_status(&chat_id).await,
        Some(GroupSizeStatus::AtLimit)
    );

    let status = service.add_participant(&chat_id, "one-too-many").await;
    assert_eq!(status.code, 7);

    // Size unchanged on both the chat record and the tree.
    let chat = service.core().chats.get(&chat_id).await.unwrap();
    assert_eq!(chat.participant_ids.len(), 500);
    assert_eq!(
        service.group_size_status(&chat_id).await,
        Some(GroupSizeStatus::AtLimit)
    );
}

#[tokio::test]
async fn rate_limit_caps_burst() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    let mut ok = 0;
    let mut limited = 0;
    for i in 0..200 {
        let resp = service.send_message(send_req(&chat_id, "alice", &format!("m{i}"))).await;
        match resp.status.code {
            0 => ok += 1,
            3 => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 60);
    assert_eq!(limited, 140);

    // No store writes beyond the limit.
    let count = service.core().store.message_count(&chat_id).await.unwrap();
    assert_eq!(count, 60);
}

#[tokio::test]
async fn stream_send_delivers_like_the_rpc() {
    let service = service().await;
    let hub = service.core().hub.clone();
    let chat_id = create_direct(&service, "alice", "bob").await;

    let (alice_conn, _alice_rx) = hub.open_connection();
    hub.authenticate(&alice_conn.connection_id, "alice", "tok", "phone").await.unwrap();
    let (bob_conn, mut bob_rx) = hub.open_connection();
    hub.authenticate(&bob_conn.connection_id, "bob", "tok", "phone").await.unwrap();
    while bob_rx.try_recv().is_ok() {}

    // The same two calls the websocket dispatch makes per NEW_MESSAGE frame.
    hub.check_rate(&alice_conn.connection_id).unwrap();
    let status = service
        .on_send_message("alice", &chat_id, "over the stream", sonet_proto::MessageType::Text, None, None)
        .await;
    assert!(status.is_ok());

    let event = next_of_kind(&mut bob_rx, EventKind::NewMessage).expect("delivered");
    assert_eq!(event.data["message"]["content"], "over the stream");
    assert_eq!(service.core().store.message_count(&chat_id).await.unwrap(), 1);

    // Validation failures surface as non-zero statuses, not silence.
    let status = service
        .on_send_message("mallory", &chat_id, "hi", sonet_proto::MessageType::Text, None, None)
        .await;
    assert_eq!(status.code, 2);
}

#[tokio::test]
async fn stream_burst_bans_the_connection() {
    let mut config = ServerConfig::default();
    config.limits.message_rate_limit = 2;
    config.hub.ban_after_violations = 2;
    let core = MessagingCore::build(config).await.unwrap();
    let service = MessagingService::new(core);
    let hub = service.core().hub.clone();
    create_direct(&service, "alice", "bob").await;

    let (conn, _rx) = hub.open_connection();
    hub.authenticate(&conn.connection_id, "alice", "tok", "phone").await.unwrap();

    // Two sends fit the window, then violations accumulate to a ban.
    assert!(hub.check_rate(&conn.connection_id).is_ok());
    assert!(hub.check_rate(&conn.connection_id).is_ok());
    assert!(matches!(
        hub.check_rate(&conn.connection_id).unwrap_err(),
        HubError::RateLimited
    ));
    assert!(matches!(
        hub.check_rate(&conn.connection_id).unwrap_err(),
        HubError::Banned
    ));
    assert_eq!(conn.status(), ConnectionStatus::Banned);
    assert!(hub.connections_for_user("alice").is_empty());
}

#[tokio::test]
async fn search_and_removal() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    let mut ids = Vec::new();
    for content in ["hello world", "goodbye", "hello there"] {
        let resp = service.send_message(send_req(&chat_id, "alice", content)).await;
        assert!(resp.status.is_ok());
        ids.push(resp.message.unwrap().message_id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    service.core().index_writer.flush().await;

    let hits = service
        .core()
        .indexer
        .search("hello", &sonet_index::SearchFilters::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    // Recency descending: "hello there" first.
    assert_eq!(hits[0].message_id, ids[2]);
    assert_eq!(hits[1].message_id, ids[0]);
    assert!(hits.iter().all(|h| h.score > 0.0));

    let status = service.delete_message(&chat_id, &ids[2], "alice").await;
    assert!(status.is_ok());

    let hits = service
        .core()
        .indexer
        .search("hello", &sonet_index::SearchFilters::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message_id, ids[0]);
}

#[tokio::test]
async fn create_chat_is_idempotent() {
    let service = service().await;
    let first = create_direct(&service, "alice", "bob").await;
    // Same pair in the other order resolves to the same chat.
    let second = create_direct(&service, "bob", "alice").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn typing_start_is_idempotent() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    for _ in 0..2 {
        let resp = service
            .set_typing(SetTypingRequest {
                chat_id: chat_id.clone(),
                user_id: "alice".into(),
                is_typing: true,
            })
            .await;
        assert!(resp.status.is_ok());
    }
    let state = service.core().hub.typing_state(&chat_id).await;
    assert_eq!(state.typing_user_ids, vec!["alice".to_string()]);

    let resp = service
        .set_typing(SetTypingRequest {
            chat_id: chat_id.clone(),
            user_id: "alice".into(),
            is_typing: false,
        })
        .await;
    assert!(resp.status.is_ok());
    let state = service.core().hub.typing_state(&chat_id).await;
    assert!(state.typing_user_ids.is_empty());
}

#[tokio::test]
async fn read_receipt_marks_message_read() {
    let service = service().await;
    let hub = service.core().hub.clone();
    let chat_id = create_direct(&service, "alice", "bob").await;

    let (alice_conn, mut alice_rx) = hub.open_connection();
    hub.authenticate(&alice_conn.connection_id, "alice", "tok", "phone").await.unwrap();

    let resp = service.send_message(send_req(&chat_id, "alice", "seen yet?")).await;
    let message_id = resp.message.unwrap().message_id;
    while alice_rx.try_recv().is_ok() {}

    service.on_read_receipt("bob", &chat_id, &message_id, "phone").await;

    let message = service.core().store.get_message(&chat_id, &message_id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Read);
    assert_eq!(message.read_receipts.len(), 1);
    assert_eq!(message.read_receipts[0].user_id, "bob");

    let event = next_of_kind(&mut alice_rx, EventKind::MessageRead).expect("read event fanned out");
    assert_eq!(event.data["message_id"], message_id);
}

#[tokio::test]
async fn send_validations_map_to_status_codes() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    // Empty content → 1.
    let resp = service.send_message(send_req(&chat_id, "alice", "")).await;
    assert_eq!(resp.status.code, 1);

    // Unknown chat → 6.
    let resp = service.send_message(send_req("ghost", "alice", "hi")).await;
    assert_eq!(resp.status.code, 6);

    // Outsider → 2.
    let resp = service.send_message(send_req(&chat_id, "mallory", "hi")).await;
    assert_eq!(resp.status.code, 2);

    // Oversized content → 4.
    let big = "x".repeat(10 * 1024 * 1024 + 1);
    let resp = service.send_message(send_req(&chat_id, "alice", &big)).await;
    assert_eq!(resp.status.code, 4);
}

#[tokio::test]
async fn edit_updates_history_and_index() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    let resp = service.send_message(send_req(&chat_id, "alice", "original wording")).await;
    let message_id = resp.message.unwrap().message_id;
    service.core().index_writer.flush().await;

    // Only the sender may edit.
    let status = service
        .edit_message(&chat_id, &message_id, "bob", "hijacked".into())
        .await;
    assert_eq!(status.code, 2);

    let status = service
        .edit_message(&chat_id, &message_id, "alice", "revised wording".into())
        .await;
    assert!(status.is_ok());
    service.core().index_writer.flush().await;

    let message = service.core().store.get_message(&chat_id, &message_id).await.unwrap();
    assert_eq!(message.content, "revised wording");
    assert_eq!(message.edit_history.len(), 1);
    assert!(message.last_edited_at.is_some());

    let hits = service
        .core()
        .indexer
        .search("original", &sonet_index::SearchFilters::default(), 10)
        .await
        .unwrap();
    assert!(hits.is_empty());
    let hits = service
        .core()
        .indexer
        .search("revised", &sonet_index::SearchFilters::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn compromise_recovery_keeps_chat_usable() {
    let service = service().await;
    let chat_id = create_direct(&service, "alice", "bob").await;

    service.core().engine.mark_key_compromised(&chat_id).unwrap();
    let resp = service.send_message(send_req(&chat_id, "alice", "fresh start")).await;
    assert!(resp.status.is_ok());
}
