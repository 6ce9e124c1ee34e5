use super::{outgoing, start_harness, wait_until};
use crate::data::{FailureKind, MessageStore};
use crate::events::CoreEvent;
use crate::send::{
    AttachmentUploadJob, GroupSendJob, ReactionSendJob, ReceiptSendJob, ResendMessageJob,
};
use crate::standard_registry;
use crate::transport::{OutboundContent, SendOutcome};

#[tokio::test]
async fn group_send_delivers_to_members_except_self() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "alice".into(), "bob".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    let mut events = harness.events.subscribe();

    let job = GroupSendJob::record(message_id, "g1", Vec::new());
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("send success", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;

    let sent = harness.transport.sent_payloads().await;
    assert_eq!(sent.len(), 1);
    let (recipients, _) = &sent[0];
    assert_eq!(recipients.len(), 2);
    assert!(!recipients.contains(&"me".to_string()));
    let state = harness.messages.state.lock().await;
    assert!(state.sent.contains(&message_id));
    assert!(state.failures.get(&message_id).map_or(true, Vec::is_empty));
    drop(state);
    assert_eq!(
        events.recv().await.expect("event"),
        CoreEvent::MessageSent { message_id }
    );
}

#[tokio::test]
async fn group_send_retries_only_the_failed_recipients() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "alice".into(), "bob".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    harness
        .transport
        .script_outcome("bob", SendOutcome::NetworkFailure)
        .await;

    let job = GroupSendJob::record(message_id, "g1", Vec::new());
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("send success", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;

    // Second attempt must target bob alone; alice already succeeded.
    let sent = harness.transport.sent_payloads().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0, vec!["bob".to_string()]);
    let state = harness.messages.state.lock().await;
    assert!(state.sent.contains(&message_id));
    assert!(state.failures.get(&message_id).map_or(true, Vec::is_empty));
}

#[tokio::test]
async fn identity_mismatch_fails_the_send_without_retrying() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "alice".into(), "bob".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    harness
        .transport
        .script_outcome("bob", SendOutcome::IdentityMismatch)
        .await;
    let mut events = harness.events.subscribe();

    let job = GroupSendJob::record(message_id, "g1", Vec::new());
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("job done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;

    assert_eq!(harness.transport.sent_payloads().await.len(), 1);
    let state = harness.messages.state.lock().await;
    assert!(state.send_failed.contains(&message_id));
    assert!(!state.sent.contains(&message_id));
    let failures = state.failures.get(&message_id).expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Identity);
    assert!(state.successes.get(&message_id).expect("successes").contains("alice"));
    drop(state);
    assert_eq!(
        events.recv().await.expect("event"),
        CoreEvent::SafetyNumberChange {
            message_id,
            recipients: vec!["bob".to_string()],
        }
    );
}

#[tokio::test]
async fn retry_after_mixed_failures_skips_identity_mismatched_recipients() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "bob".into(), "carol".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    harness
        .transport
        .script_outcome("bob", SendOutcome::NetworkFailure)
        .await;
    harness
        .transport
        .script_outcome("carol", SendOutcome::IdentityMismatch)
        .await;
    let mut events = harness.events.subscribe();

    let job = GroupSendJob::record(message_id, "g1", Vec::new());
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("job done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;

    // The retry goes to bob alone; carol's identity change waits for the user.
    assert_eq!(harness.transport.send_count_for("carol").await, 1);
    let sent = harness.transport.sent_payloads().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0, vec!["bob".to_string()]);
    let state = harness.messages.state.lock().await;
    assert!(state.send_failed.contains(&message_id));
    assert!(!state.sent.contains(&message_id));
    let failures = state.failures.get(&message_id).expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].recipient, "carol");
    assert_eq!(failures[0].kind, FailureKind::Identity);
    assert!(state.successes.get(&message_id).expect("successes").contains("bob"));
    drop(state);
    assert_eq!(
        events.recv().await.expect("event"),
        CoreEvent::SafetyNumberChange {
            message_id,
            recipients: vec!["carol".to_string()],
        }
    );
}

#[tokio::test]
async fn group_send_with_filter_targets_exactly_the_filter() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "alice".into(), "bob".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;

    let job = GroupSendJob::record(message_id, "g1", vec!["bob".to_string()]);
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("send success", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;
    let sent = harness.transport.sent_payloads().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, vec!["bob".to_string()]);
}

#[tokio::test]
async fn resend_after_identity_approval_clears_the_failure() {
    let harness = start_harness(standard_registry());
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    harness
        .messages
        .add_failure(
            message_id,
            crate::data::RecipientFailure {
                recipient: "bob".to_string(),
                kind: FailureKind::Identity,
            },
        )
        .await
        .expect("seed failure");

    let job = ResendMessageJob::record(message_id, "bob");
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("resend success", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;
    let state = harness.messages.state.lock().await;
    assert!(state.failures.get(&message_id).map_or(true, Vec::is_empty));
    assert!(state.successes.get(&message_id).expect("successes").contains("bob"));
}

#[tokio::test]
async fn undelivered_reaction_rolls_back_the_local_add() {
    let harness = start_harness(standard_registry());
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    // The UI applied the reaction optimistically before enqueueing.
    harness
        .messages
        .add_reaction(message_id, "me", "👍")
        .await
        .expect("seed reaction");
    for _ in 0..5 {
        harness
            .transport
            .script_outcome("alice", SendOutcome::NetworkFailure)
            .await;
    }

    let job = ReactionSendJob::record(message_id, "👍", false, "alice", 123, vec!["alice".into()]);
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("reaction failed", || async {
        harness.storage.failed().await.contains(&id)
    })
    .await;
    let state = harness.messages.state.lock().await;
    assert!(
        !state.reactions.contains_key(&(message_id, "me".to_string())),
        "rollback must remove the optimistic reaction"
    );
}

#[tokio::test]
async fn partially_delivered_reaction_is_not_rolled_back() {
    let harness = start_harness(standard_registry());
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    harness
        .messages
        .add_reaction(message_id, "me", "👍")
        .await
        .expect("seed reaction");
    for _ in 0..5 {
        harness
            .transport
            .script_outcome("bob", SendOutcome::NetworkFailure)
            .await;
    }

    let job = ReactionSendJob::record(
        message_id,
        "👍",
        false,
        "alice",
        123,
        vec!["alice".into(), "bob".into()],
    );
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("reaction failed", || async {
        harness.storage.failed().await.contains(&id)
    })
    .await;
    let state = harness.messages.state.lock().await;
    assert!(
        state.reactions.contains_key(&(message_id, "me".to_string())),
        "alice received the reaction, so it must stand"
    );
}

#[tokio::test]
async fn stale_reaction_job_sends_nothing() {
    let harness = start_harness(standard_registry());
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    // The user already changed the reaction to something else.
    harness
        .messages
        .add_reaction(message_id, "me", "🔥")
        .await
        .expect("seed reaction");

    let job = ReactionSendJob::record(message_id, "👍", false, "alice", 123, vec!["alice".into()]);
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("job done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;
    assert!(harness.transport.sent_payloads().await.is_empty());
}

#[tokio::test]
async fn upload_then_dependent_send() {
    let harness = start_harness(standard_registry());
    harness
        .messages
        .set_group("g1", vec!["me".into(), "alice".into()])
        .await;
    let message = outgoing("g1");
    let message_id = message.id;
    harness.messages.insert_outgoing(message).await;
    {
        let mut state = harness.messages.state.lock().await;
        state
            .attachment_payloads
            .insert((message_id, 0), vec![1, 2, 3]);
    }
    harness.transport.fail_uploads(1).await;

    let upload = AttachmentUploadJob::record(message_id, 0);
    let upload_id = harness.manager.enqueue(upload).await.expect("enqueue");
    let send = GroupSendJob::record(message_id, "g1", Vec::new());
    let send_id = harness
        .manager
        .enqueue_dependent(send, vec![upload_id])
        .await
        .expect("enqueue");

    wait_until("send success", || async {
        harness.storage.succeeded().await.contains(&send_id)
    })
    .await;
    let state = harness.messages.state.lock().await;
    assert!(state.attachment_remotes.contains_key(&(message_id, 0)));
    assert!(state.sent.contains(&message_id));
}

#[tokio::test]
async fn read_receipts_respect_the_privacy_setting() {
    let mut config = super::test_config();
    config.read_receipts_enabled = false;
    let harness = super::start_harness_with(
        standard_registry(),
        config,
        crate::config::DeviceState::default(),
        None,
    );

    let job = ReceiptSendJob::record("alice", true, vec![111]);
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("job done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;
    assert!(harness.transport.sent_payloads().await.is_empty());
}

#[tokio::test]
async fn delivery_receipts_carry_their_timestamps() {
    let harness = start_harness(standard_registry());
    let job = ReceiptSendJob::record("alice", false, vec![111, 222]);
    let id = harness.manager.enqueue(job).await.expect("enqueue");
    wait_until("job done", || async {
        harness.storage.succeeded().await.contains(&id)
    })
    .await;
    let sent = harness.transport.sent_payloads().await;
    assert_eq!(sent.len(), 1);
    match &sent[0].1.content {
        OutboundContent::Receipt { timestamps, .. } => assert_eq!(timestamps, &vec![111, 222]),
        other => panic!("unexpected payload {other:?}"),
    }
}
