//! Scenario: a conversation driven through a durable queue.
//!
//! The client enqueues typed messages on `inbox`. Each execution takes one
//! message, asks an activity for a reply, publishes it as custom status and then
//! continues as new. A message containing "bye" ends the conversation.

use duralane::{
    ActivityContext, ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus,
    Runtime,
};
use std::time::{Duration, Instant};

#[path = "../common/mod.rs"]
mod common;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct Message {
    seq: u32,
    text: String,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct ConversationStatus {
    state: String,
    msg_seq: u32,
    reply: String,
}

fn registries() -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Reply", |_ctx: ActivityContext, text: String| async move { Ok(format!("re: {text}")) })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Conversation", |ctx: OrchestrationContext, _input: String| async move {
            let msg: Message = ctx.dequeue_event_typed("inbox").await?;
            let reply = ctx.schedule_activity("Reply", msg.text.clone()).await?;
            let status = ConversationStatus {
                state: "replied".to_string(),
                msg_seq: msg.seq,
                reply,
            };
            ctx.set_custom_status(serde_json::to_string(&status).map_err(|e| e.to_string())?);

            if msg.text.to_lowercase().contains("bye") {
                return Ok(format!("conversation ended at msg_seq {}", msg.seq));
            }
            ctx.continue_as_new("").await
        })
        .build();
    (activities, orchestrations)
}

/// Long-poll until the status reports `seq`, recording every version seen.
async fn wait_for_reply(client: &Client, instance: &str, seq: u32, versions: &mut Vec<u64>) -> OrchestrationStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let since = versions.last().copied().unwrap_or(0);
        let status = client
            .wait_for_status_change(
                instance,
                since,
                Duration::from_millis(10),
                deadline.saturating_duration_since(Instant::now()),
            )
            .await
            .unwrap_or_else(|e| panic!("no reply for seq {seq}: {e}"));

        let version = status.custom_status_version();
        assert!(version > since, "long-poll returned version {version} with since={since}");
        versions.push(version);
        if let Some(cs) = status
            .custom_status()
            .and_then(|s| serde_json::from_str::<ConversationStatus>(s).ok())
            && cs.msg_seq == seq
        {
            assert_eq!(cs.state, "replied");
            return status;
        }
        assert!(!status.is_terminal(), "finished before seq {seq}: {status:?}");
    }
}

#[tokio::test]
async fn three_turn_conversation_across_executions() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let (activities, orchestrations) = registries();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    client.start_orchestration("chat-1", "Conversation", "").await.unwrap();

    let mut versions = Vec::new();
    let turns = [(1, "Hello!"), (2, "How are you?"), (3, "Bye now")];
    let mut last = OrchestrationStatus::NotFound;
    for (seq, text) in turns {
        client
            .enqueue_event_typed("chat-1", "inbox", &Message { seq, text: text.to_string() })
            .await
            .unwrap();
        last = wait_for_reply(&client, "chat-1", seq, &mut versions).await;
    }
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "versions must increase: {versions:?}");
    assert!(versions.len() >= 3);

    if !last.is_terminal() {
        last = client
            .wait_for_orchestration("chat-1", Duration::from_secs(5))
            .await
            .unwrap();
    }
    match last {
        OrchestrationStatus::Completed {
            output,
            custom_status,
            custom_status_version,
        } => {
            assert_eq!(output, "conversation ended at msg_seq 3");
            let cs: ConversationStatus = serde_json::from_str(custom_status.as_deref().unwrap()).unwrap();
            assert_eq!(cs.reply, "re: Bye now");
            assert_eq!(custom_status_version, *versions.last().unwrap());
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // One execution per message.
    let final_history = client.read_history("chat-1").await.unwrap();
    assert_eq!(final_history[0].execution_id, 3);

    rt.shutdown(None).await;
}

/// Messages queued before the orchestration reaches them are carried into later
/// executions in order.
#[tokio::test]
async fn queued_messages_survive_continue_as_new() {
    let store = common::in_memory_store();
    let (activities, orchestrations) = registries();
    let client = Client::new(store.clone());

    client.start_orchestration("chat-2", "Conversation", "").await.unwrap();
    for (seq, text) in [(1, "one"), (2, "two"), (3, "bye")] {
        client
            .enqueue_event_typed("chat-2", "inbox", &Message { seq, text: text.to_string() })
            .await
            .unwrap();
    }

    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options()).await;
    match client
        .wait_for_orchestration("chat-2", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed {
            output,
            custom_status_version,
            ..
        } => {
            assert_eq!(output, "conversation ended at msg_seq 3");
            assert_eq!(custom_status_version, 3);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    rt.shutdown(None).await;
}
