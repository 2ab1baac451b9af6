//! Group fan-out over pairwise sends.
//!
//! A group message is one `GroupEnvelope` encrypted separately for each
//! member. The logical message is tracked under a base id; each member's
//! copy is tracked under `<base>_<member>`.

use std::sync::Arc;

use super::chat_types::{
    unix_now, DeliveryState, GroupDescriptor, GroupEnvelope, GroupMember, MemberResult,
    SendSummary,
};
use super::delivery_tracker::DeliveryTracker;
use super::dispatcher::Dispatcher;

pub struct GroupFanout {
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<DeliveryTracker>,
    self_id: String,
}

impl GroupFanout {
    pub fn new(dispatcher: Arc<Dispatcher>, tracker: Arc<DeliveryTracker>, self_id: &str) -> Self {
        Self {
            dispatcher,
            tracker,
            self_id: self_id.to_string(),
        }
    }

    /// Send `plaintext` to every reachable member of `group_id`.
    pub fn send_group_message(
        &self,
        group_id: &str,
        members: &[GroupMember],
        plaintext: &str,
        message_id: Option<&str>,
    ) -> SendSummary {
        let base_id = message_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("grp_{}", uuid::Uuid::new_v4()));

        let envelope = GroupEnvelope::GroupMessage {
            group_id: group_id.to_string(),
            sender_id: self.self_id.clone(),
            content: serde_json::Value::String(plaintext.to_string()),
            timestamp: unix_now(),
            message_id: base_id.clone(),
        };

        self.fan_out(group_id, &base_id, &envelope, plaintext, members)
    }

    /// Invite every reachable member to `group`.
    pub fn send_group_invitation(
        &self,
        group: &GroupDescriptor,
        members: &[GroupMember],
    ) -> SendSummary {
        let base_id = format!("inv_{}_{}", group.group_id, uuid::Uuid::new_v4());

        let envelope = GroupEnvelope::GroupInvitation {
            group_id: group.group_id.clone(),
            sender_id: self.self_id.clone(),
            group_name: group.name.clone(),
            description: group.description.clone(),
            created_by: group.created_by.clone(),
            members: group.members.clone(),
            avatar_path: group.avatar_path.clone(),
            timestamp: unix_now(),
            message_id: base_id.clone(),
        };

        self.fan_out(&group.group_id, &base_id, &envelope, &group.name, members)
    }

    fn fan_out(
        &self,
        group_id: &str,
        base_id: &str,
        envelope: &GroupEnvelope,
        summary_text: &str,
        members: &[GroupMember],
    ) -> SendSummary {
        if self.tracker.register(base_id, group_id, summary_text) {
            self.tracker
                .transition(base_id, DeliveryState::Sending, None);
        }

        let payload = match serde_json::to_string(envelope) {
            Ok(p) => p,
            Err(e) => {
                log::error!("Failed to serialize group envelope {}: {}", base_id, e);
                self.tracker.transition(
                    base_id,
                    DeliveryState::Error,
                    Some(format!("serialize envelope: {}", e)),
                );
                return SendSummary {
                    success: false,
                    sent_count: 0,
                    total_members: 0,
                    base_message_id: base_id.to_string(),
                    per_member_results: Vec::new(),
                };
            }
        };

        let mut per_member_results = Vec::new();
        for member in members.iter().filter(|m| m.user_id != self.self_id) {
            let Some((address, public_key)) = member.connection() else {
                log::warn!(
                    "Skipping group member {} in {}: no address or key",
                    member.user_id,
                    group_id
                );
                continue;
            };

            let member_msg_id = format!("{}_{}", base_id, member.user_id);
            let accepted =
                self.dispatcher
                    .submit_send(address, public_key, &payload, Some(member_msg_id.as_str()));
            per_member_results.push(MemberResult {
                member_id: member.user_id.clone(),
                message_id: member_msg_id,
                accepted,
            });
        }

        let total_members = per_member_results.len();
        let sent_count = per_member_results.iter().filter(|r| r.accepted).count();

        if sent_count > 0 {
            self.tracker.transition(base_id, DeliveryState::Sent, None);
        } else {
            self.tracker.transition(
                base_id,
                DeliveryState::Failed,
                Some("no reachable members".to_string()),
            );
        }

        log::info!(
            "Group {} message {}: queued for {}/{} members",
            group_id,
            base_id,
            sent_count,
            total_members
        );

        SendSummary {
            success: sent_count > 0,
            sent_count,
            total_members,
            base_message_id: base_id.to_string(),
            per_member_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::MessageCipher;
    use crate::crypto::identity::Identity;
    use crate::services::dispatcher::DispatcherConfig;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Setup {
        fanout: GroupFanout,
        tracker: Arc<DeliveryTracker>,
    }

    fn setup() -> Setup {
        let cipher = MessageCipher::new(Arc::new(Identity::generate()));
        let tracker = Arc::new(DeliveryTracker::new());
        let dispatcher = Arc::new(
            Dispatcher::start(
                DispatcherConfig {
                    sender_id: "alice".into(),
                    request_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
                cipher,
                tracker.clone(),
            )
            .unwrap(),
        );
        Setup {
            fanout: GroupFanout::new(dispatcher, tracker.clone(), "alice"),
            tracker,
        }
    }

    fn member(id: &str, addr: Option<&str>, key: Option<String>) -> GroupMember {
        GroupMember {
            user_id: id.to_string(),
            onion_address: addr.map(str::to_string),
            public_key: key,
        }
    }

    fn key() -> String {
        Identity::generate().public_key_hex()
    }

    #[tokio::test]
    async fn test_skips_self_and_members_without_connection_info() {
        let s = setup();
        let members = vec![
            member("alice", Some("alice.onion"), Some(key())),
            member("bob", Some("bob.onion"), Some(key())),
            member("carol", None, Some(key())),
            member("dave", Some("dave.onion"), Some(String::new())),
        ];

        let summary = s
            .fanout
            .send_group_message("g1", &members, "hello", Some("grp_fixed"));

        assert_eq!(summary.total_members, 1);
        assert_eq!(summary.sent_count, 1);
        assert!(summary.success);
        assert_eq!(summary.base_message_id, "grp_fixed");
        assert_eq!(summary.per_member_results[0].member_id, "bob");
        assert_eq!(summary.per_member_results[0].message_id, "grp_fixed_bob");
        assert_eq!(s.tracker.get_state("grp_fixed"), Some(DeliveryState::Sent));
        assert!(s.tracker.snapshot("grp_fixed_bob").is_some());
        assert!(s.tracker.snapshot("grp_fixed_carol").is_none());
    }

    #[tokio::test]
    async fn test_no_reachable_members_fails_base_id() {
        let s = setup();
        let members = vec![member("bob", None, None)];

        let summary = s.fanout.send_group_message("g1", &members, "hello", None);

        assert!(!summary.success);
        assert_eq!(summary.total_members, 0);
        assert_eq!(summary.sent_count, 0);
        assert!(summary.base_message_id.starts_with("grp_"));
        let snap = s.tracker.snapshot(&summary.base_message_id).unwrap();
        assert_eq!(snap.state, Some(DeliveryState::Failed));
        assert_eq!(snap.last_error.as_deref(), Some("no reachable members"));
    }

    #[tokio::test]
    async fn test_envelope_reaches_each_member() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let s = setup();
        let addr = server.address().to_string();
        let members = vec![
            member("bob", Some(addr.as_str()), Some(key())),
            member("carol", Some(addr.as_str()), Some(key())),
        ];
        let summary = s
            .fanout
            .send_group_message("g1", &members, "hi all", Some("grp_x"));
        assert_eq!(summary.sent_count, 2);

        for _ in 0..50 {
            let done = ["grp_x_bob", "grp_x_carol"]
                .iter()
                .all(|id| s.tracker.get_state(id) == Some(DeliveryState::Delivered));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            s.tracker.get_state("grp_x_bob"),
            Some(DeliveryState::Delivered)
        );
        assert_eq!(
            s.tracker.get_state("grp_x_carol"),
            Some(DeliveryState::Delivered)
        );
        // Per-member outcomes never move the base id past `sent`.
        assert_eq!(s.tracker.get_state("grp_x"), Some(DeliveryState::Sent));
    }

    #[tokio::test]
    async fn test_invitation_ids() {
        let s = setup();
        let group = GroupDescriptor {
            group_id: "g7".into(),
            name: "Friends".into(),
            description: "weekend plans".into(),
            created_by: "alice".into(),
            members: vec!["alice".into(), "bob".into()],
            avatar_path: None,
        };
        let members = vec![member("bob", Some("bob.onion"), Some(key()))];

        let summary = s.fanout.send_group_invitation(&group, &members);

        assert!(summary.base_message_id.starts_with("inv_g7_"));
        assert_eq!(
            summary.per_member_results[0].message_id,
            format!("{}_bob", summary.base_message_id)
        );
        assert_eq!(summary.total_members, 1);
    }
}
