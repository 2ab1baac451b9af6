//! End-to-end tests: two or more messengers talking over loopback with Tor
//! disabled.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use torline_lib::crypto::cipher::MessageCipher;
use torline_lib::crypto::identity::IdentityManager;
use torline_lib::crypto::key_store::KeyStore;
use torline_lib::{
    DeliveryState, GroupDescriptor, GroupMember, InboundEvent, Messenger, MessengerConfig,
    StatusUpdate,
};

fn config(tmp: &TempDir, user_id: &str) -> MessengerConfig {
    let mut cfg = MessengerConfig::default();
    cfg.identity.user_id = user_id.to_string();
    cfg.identity.data_dir = Some(tmp.path().join(user_id));
    cfg.tor.enabled = false;
    cfg.server.port = 0;
    cfg.dispatch.request_timeout_secs = 5;
    cfg
}

async fn start(tmp: &TempDir, user_id: &str) -> Messenger {
    Messenger::start(config(tmp, user_id)).await.unwrap()
}

fn member_of(m: &Messenger) -> GroupMember {
    let info = m.connection_info();
    GroupMember {
        user_id: info.user_id,
        onion_address: Some(info.onion_address),
        public_key: Some(info.public_key),
    }
}

async fn next_event(rx: &mut UnboundedReceiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no inbound event")
        .expect("inbox closed")
}

/// Collect the states seen for `message_id` until it stops moving.
async fn states_for(
    rx: &mut UnboundedReceiver<StatusUpdate>,
    message_id: &str,
) -> Vec<DeliveryState> {
    let mut seen = Vec::new();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no status update")
            .expect("status stream closed");
        if update.message_id != message_id {
            continue;
        }
        seen.push(update.state);
        if update.state.is_failure() || update.state == DeliveryState::Delivered {
            return seen;
        }
    }
}

#[test]
fn test_identity_survives_reload() {
    let tmp = TempDir::new().unwrap();
    let ks = KeyStore::new(tmp.path()).unwrap();
    let bob_tmp = TempDir::new().unwrap();
    let bob_ks = KeyStore::new(bob_tmp.path()).unwrap();

    let alice = IdentityManager::load_or_create(&ks, "alice").unwrap();
    let bob = IdentityManager::load_or_create(&bob_ks, "bob").unwrap();
    let alice_pk = alice.public_key_hex();

    let bob_cipher = MessageCipher::new(Arc::new(bob.into_identity()));
    let ciphertext = MessageCipher::new(Arc::new(alice.into_identity()))
        .encrypt("before restart", &bob_cipher.public_key_hex())
        .unwrap();

    // Reload from disk: same key, and old traffic still opens.
    let reloaded = IdentityManager::load_or_create(&ks, "alice").unwrap();
    assert_eq!(reloaded.public_key_hex(), alice_pk);
    assert_eq!(
        bob_cipher.decrypt(&ciphertext, &reloaded.public_key_hex()).unwrap(),
        "before restart"
    );
}

#[tokio::test]
async fn test_direct_message_flow() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let mut bob = start(&tmp, "bob").await;
    let mut alice_status = alice.subscribe_status();
    let mut bob_inbox = bob.subscribe_messages();

    let bob_info = bob.connection_info();
    let submission = alice.send_message(
        &bob_info.onion_address,
        &bob_info.public_key,
        "hi",
        Some("m-direct"),
    );
    assert!(submission.accepted);
    assert_eq!(submission.message_id, "m-direct");

    assert_eq!(
        states_for(&mut alice_status, "m-direct").await,
        vec![
            DeliveryState::Sending,
            DeliveryState::Sent,
            DeliveryState::Delivered
        ]
    );

    match next_event(&mut bob_inbox).await {
        InboundEvent::Direct {
            sender_id,
            message,
            sender_public_key,
            ..
        } => {
            assert_eq!(sender_id, "alice");
            assert_eq!(message, "hi");
            assert_eq!(sender_public_key, alice.connection_info().public_key);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(alice.mark_as_read("m-direct"));
    assert_eq!(
        alice.get_message_status("m-direct"),
        Some(DeliveryState::Read)
    );
    assert!(!alice.mark_as_read("m-direct"));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_reply_in_both_directions() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let mut bob = start(&tmp, "bob").await;
    let mut alice_inbox = alice.subscribe_messages();
    let mut bob_inbox = bob.subscribe_messages();

    let a = alice.connection_info();
    let b = bob.connection_info();
    alice.send_message(&b.onion_address, &b.public_key, "ping", None);
    assert!(matches!(
        next_event(&mut bob_inbox).await,
        InboundEvent::Direct { ref message, .. } if message == "ping"
    ));

    bob.send_message(&a.onion_address, &a.public_key, "pong", None);
    assert!(matches!(
        next_event(&mut alice_inbox).await,
        InboundEvent::Direct { ref message, ref sender_id, .. } if message == "pong" && sender_id == "bob"
    ));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_group_message_flow() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let mut bob = start(&tmp, "bob").await;
    let mut carol = start(&tmp, "carol").await;
    let mut alice_status = alice.subscribe_status();
    let mut bob_inbox = bob.subscribe_messages();
    let mut carol_inbox = carol.subscribe_messages();

    let members = vec![
        member_of(&alice),
        member_of(&bob),
        member_of(&carol),
        GroupMember {
            user_id: "dave".into(),
            onion_address: None,
            public_key: None,
        },
    ];

    let summary = alice.send_group_message("g1", &members, "Hello group!", Some("grp_1"));
    assert!(summary.success);
    assert_eq!(summary.total_members, 2);
    assert_eq!(summary.sent_count, 2);
    assert_eq!(summary.base_message_id, "grp_1");

    let (bob_event, carol_event) =
        futures::future::join(next_event(&mut bob_inbox), next_event(&mut carol_inbox)).await;
    for event in [bob_event, carol_event] {
        match event {
            InboundEvent::GroupMessage {
                sender_id,
                group_id,
                message,
                message_id,
                ..
            } => {
                assert_eq!(sender_id, "alice");
                assert_eq!(group_id, "g1");
                assert_eq!(message, "Hello group!");
                assert_eq!(message_id, "grp_1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(
        states_for(&mut alice_status, "grp_1_bob").await.last(),
        Some(&DeliveryState::Delivered)
    );
    assert_eq!(
        alice.get_message_status("grp_1"),
        Some(DeliveryState::Sent)
    );
    assert_eq!(alice.get_message_status("grp_1_dave"), None);

    alice.close().await;
    bob.close().await;
    carol.close().await;
}

#[tokio::test]
async fn test_group_invitation_flow() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let mut bob = start(&tmp, "bob").await;
    let mut bob_inbox = bob.subscribe_messages();

    let group = GroupDescriptor {
        group_id: "grp_team".into(),
        name: "Team".into(),
        description: "release planning".into(),
        created_by: "alice".into(),
        members: vec!["alice".into(), "bob".into()],
        avatar_path: None,
    };
    let summary = alice.send_group_invitation(&group, &[member_of(&alice), member_of(&bob)]);
    assert!(summary.success);
    assert_eq!(summary.total_members, 1);

    match next_event(&mut bob_inbox).await {
        InboundEvent::GroupInvitation {
            sender_id,
            group_id,
            group_name,
            description,
            created_by,
            members,
            ..
        } => {
            assert_eq!(sender_id, "alice");
            assert_eq!(group_id, "grp_team");
            assert_eq!(group_name, "Team");
            assert_eq!(description, "release planning");
            assert_eq!(created_by, "alice");
            assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
        }
        other => panic!("unexpected event {:?}", other),
    }

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_unreachable_peer_reports_connection_error() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let mut status = alice.subscribe_status();

    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let peer_key = IdentityManager::load_or_create(
        &KeyStore::new(&tmp.path().join("ghost")).unwrap(),
        "ghost",
    )
    .unwrap()
    .public_key_hex();

    alice.send_message(
        &format!("127.0.0.1:{}", dead_port),
        &peer_key,
        "anyone there?",
        Some("m-dead"),
    );
    let states = states_for(&mut status, "m-dead").await;
    assert_eq!(
        states,
        vec![
            DeliveryState::Sending,
            DeliveryState::Sent,
            DeliveryState::ConnectionError
        ]
    );
    assert!(!alice.mark_as_read("m-dead"));

    alice.close().await;
}

#[tokio::test]
async fn test_send_after_close_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut alice = start(&tmp, "alice").await;
    let bob_ks = KeyStore::new(&tmp.path().join("b")).unwrap();
    let bob = IdentityManager::load_or_create(&bob_ks, "bob").unwrap();
    alice.close().await;

    let submission = alice.send_message("127.0.0.1:1", &bob.public_key_hex(), "late", None);
    assert!(!submission.accepted);
    assert_eq!(
        alice.get_message_status(&submission.message_id),
        Some(DeliveryState::Error)
    );
}
