mod common;

use common::*;
use serde_json::json;
use soulchat::client::{ ChatSession, DetailAction, Phase, ReassemblyEvent, SessionOptions, ThreadListView };
use soulchat::error::ClientError;
use soulchat::history::{ ChangeEvent, ChangeKind, ChannelStatus, MemoryMirror, ThreadMirror };
use soulchat::models::chat::{ ChatMessage, MirrorRow, Role };
use soulchat::models::stream::StreamFrame;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn options() -> SessionOptions {
    SessionOptions {
        system_prompt: Some("Be brief.".into()),
        ..Default::default()
    }
}

fn row_with(count: usize) -> MirrorRow {
    let mut thread = scenario_thread();
    thread.messages = (0..count)
        .map(|i| ChatMessage::new(if i % 2 == 0 { Role::User } else { Role::Assistant }, format!("m{}", i)))
        .collect();
    MirrorRow::from_thread(&thread, "test-user-123")
}

async fn next_actions(session: &mut ChatSession) -> Vec<DetailAction> {
    for _ in 0..50 {
        let actions = session.poll_changes().await.unwrap();
        if !actions.is_empty() {
            return actions;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn transport_error_before_any_chunk_falls_back_once() {
    let transport = Arc::new(
        FakeTransport::with(
            vec![StreamScript::FramesThenBreak(vec![StreamFrame::ThreadId("t1".into())])],
            vec![SendScript::Reply("Hi there", "t1")]
        )
    );
    let mut session = ChatSession::new(transport.clone(), options());

    let events = session.send("Hello").await.unwrap();

    let streamed = transport.stream_requests.lock().unwrap()[0].clone();
    let retried = transport.send_calls();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].message, streamed.message);
    assert_eq!(retried[0].thread_id, streamed.thread_id);
    assert_eq!(retried[0].system_prompt.as_deref(), Some("Be brief."));
    assert_eq!(retried[0].stream, Some(false));

    assert_eq!(session.state().phase(), Phase::Complete);
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.messages()[1].content, "Hi there");
    assert_eq!(session.thread_id(), Some("t1"));
    assert!(events.contains(&ReassemblyEvent::ThreadIdLatched("t1".into())));
}

#[tokio::test]
async fn refused_stream_falls_back() {
    let transport = Arc::new(
        FakeTransport::with(vec![StreamScript::Refuse], vec![SendScript::Reply("Hi there", "t1")])
    );
    let mut session = ChatSession::new(transport.clone(), options());

    session.send("Hello").await.unwrap();

    assert_eq!(transport.send_calls().len(), 1);
    assert_eq!(session.messages()[1].content, "Hi there");
}

#[tokio::test]
async fn no_fallback_once_text_has_arrived() {
    let transport = Arc::new(
        FakeTransport::with(
            vec![StreamScript::FramesThenBreak(vec![StreamFrame::ThreadId("t1".into()), StreamFrame::Chunk("Hi".into())])],
            vec![SendScript::Reply("unused", "t1")]
        )
    );
    let mut session = ChatSession::new(transport.clone(), options());

    let events = session.send("Hello").await.unwrap();

    assert!(transport.send_calls().is_empty());
    assert_eq!(session.state().phase(), Phase::Error);
    assert_eq!(session.messages()[1].content, "Hi");
    assert!(matches!(events.last(), Some(ReassemblyEvent::Failed(_))));
}

#[tokio::test]
async fn error_frame_is_not_a_transport_failure() {
    let transport = Arc::new(
        FakeTransport::with(
            vec![StreamScript::Frames(vec![StreamFrame::ThreadId("t1".into()), StreamFrame::Error("model overloaded".into())])],
            vec![]
        )
    );
    let mut session = ChatSession::new(transport.clone(), options());

    session.send("Hello").await.unwrap();

    assert!(transport.send_calls().is_empty());
    assert_eq!(session.state().error(), Some("model overloaded"));
    assert_eq!(session.messages().len(), 1);

    session.dismiss_error();
    assert_eq!(session.state().phase(), Phase::Idle);
}

#[tokio::test]
async fn failed_fallback_keeps_user_message_and_shows_error() {
    let transport = Arc::new(FakeTransport::with(vec![StreamScript::Refuse], vec![SendScript::Fail(500)]));
    let mut session = ChatSession::new(transport.clone(), options());

    session.send("Hello").await.unwrap();

    assert_eq!(transport.send_calls().len(), 1);
    assert_eq!(session.state().phase(), Phase::Error);
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].content, "Hello");
    assert!(session.state().error().is_some());
}

#[tokio::test]
async fn streamed_reply_accumulates() {
    let transport = Arc::new(
        FakeTransport::with(
            vec![
                StreamScript::Frames(
                    vec![
                        StreamFrame::ThreadId("t1".into()),
                        StreamFrame::Chunk("Hel".into()),
                        StreamFrame::Chunk("lo, ".into()),
                        StreamFrame::Chunk("world".into()),
                        StreamFrame::Done
                    ]
                )
            ],
            vec![]
        )
    );
    let mut session = ChatSession::new(transport, options());
    let mut seen = Vec::new();

    session.send_with("Hi", |state| seen.push(state.phase())).await.unwrap();

    assert_eq!(session.messages()[1].content, "Hello, world");
    assert_eq!(session.state().phase(), Phase::Complete);
    assert_eq!(seen.first(), Some(&Phase::AwaitingFirstChunk));
    assert!(seen.contains(&Phase::Accumulating));
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let transport = Arc::new(FakeTransport::default());
    let mut session = ChatSession::new(transport.clone(), options());
    assert!(matches!(session.send("   ").await, Err(ClientError::EmptyMessage)));
    assert!(transport.stream_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn follow_up_reuses_thread_id() {
    let transport = Arc::new(
        FakeTransport::with(
            vec![
                StreamScript::Frames(vec![StreamFrame::ThreadId("t1".into()), StreamFrame::Chunk("a".into()), StreamFrame::Done]),
                StreamScript::Frames(vec![StreamFrame::Chunk("b".into()), StreamFrame::Done])
            ],
            vec![]
        )
    );
    let mut session = ChatSession::new(transport.clone(), options());
    session.send("one").await.unwrap();
    session.send("two").await.unwrap();

    let requests = transport.stream_requests.lock().unwrap().clone();
    assert_eq!(requests[0].new_thread, Some(true));
    assert_eq!(requests[1].thread_id.as_deref(), Some("t1"));
    assert_eq!(requests[1].new_thread, Some(false));
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn history_prefers_mirror_then_falls_back_to_api() {
    let transport = Arc::new(FakeTransport::default());
    *transport.thread.lock().unwrap() = Some(scenario_thread());
    let mirror = Arc::new(MemoryMirror::new());
    let mut session = ChatSession::new(transport.clone(), options()).with_mirror(mirror.clone());

    session.load_thread("t1").await.unwrap();
    assert_eq!(transport.thread_reads.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages().len(), 3);

    mirror.upsert(&row_with(5)).await.unwrap();
    session.load_thread("t1").await.unwrap();
    assert_eq!(transport.thread_reads.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages().len(), 5);
}

#[tokio::test]
async fn pushed_updates_replace_or_refetch() {
    let transport = Arc::new(FakeTransport::default());
    *transport.thread.lock().unwrap() = Some(scenario_thread());
    let mirror = Arc::new(MemoryMirror::new());
    mirror.upsert(&row_with(2)).await.unwrap();

    let mut session = ChatSession::new(transport.clone(), options())
        .with_mirror(mirror.clone())
        .with_feed(mirror.clone());
    session.select_thread("t1").await.unwrap();
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.subscription_status(), Some(ChannelStatus::Subscribed));

    // N + k: take the pushed messages.
    mirror.upsert(&row_with(4)).await.unwrap();
    let actions = next_actions(&mut session).await;
    assert!(matches!(actions.as_slice(), [DetailAction::Replace(m)] if m.len() == 4));
    assert_eq!(session.messages().len(), 4);

    // Same count: read the thread again instead of trusting the payload.
    mirror.upsert(&row_with(4)).await.unwrap();
    let actions = next_actions(&mut session).await;
    assert_eq!(actions, vec![DetailAction::Refetch]);
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn deleted_thread_clears_the_view() {
    let transport = Arc::new(FakeTransport::default());
    let mirror = Arc::new(MemoryMirror::new());
    mirror.upsert(&row_with(2)).await.unwrap();

    let mut session = ChatSession::new(transport, options()).with_mirror(mirror.clone()).with_feed(mirror.clone());
    session.select_thread("t1").await.unwrap();

    mirror.delete("t1").await.unwrap();
    let actions = next_actions(&mut session).await;
    assert_eq!(actions, vec![DetailAction::Clear]);
    assert!(session.thread_id().is_none());
    assert!(session.messages().is_empty());
    assert!(!session.is_subscribed());
}

#[tokio::test]
async fn other_threads_are_ignored() {
    let transport = Arc::new(FakeTransport::default());
    let mut session = ChatSession::new(transport, options());
    let event = ChangeEvent {
        event_type: ChangeKind::Update,
        new: Some(json!({ "id": "t2", "messages": [] })),
        old: None,
    };
    assert_eq!(session.handle_change(&event).await.unwrap(), DetailAction::Ignore);
}

#[tokio::test]
async fn list_view_follows_inserts_and_deletes() {
    let mirror = Arc::new(MemoryMirror::new());
    mirror.upsert(&row_with(2)).await.unwrap();

    let mut list = ThreadListView::new(mirror.clone(), Some("test-user-123".into())).with_feed(mirror.clone());
    list.open().await.unwrap();
    assert_eq!(list.rows().len(), 1);
    assert_eq!(list.subscription_status(), Some(ChannelStatus::Subscribed));

    let mut other = scenario_thread();
    other.id = "t2".into();
    mirror.upsert(&MirrorRow::from_thread(&other, "test-user-123")).await.unwrap();
    mirror.delete("t1").await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..50 {
        list.poll_changes().await.unwrap();
        ids = list.rows().iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        if ids == vec!["t2".to_string()] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ids, vec!["t2".to_string()]);
}

#[tokio::test]
async fn list_view_keeps_to_its_owner() {
    let mirror = Arc::new(MemoryMirror::new());
    mirror.upsert(&row_with(2)).await.unwrap();

    let mut list = ThreadListView::new(mirror.clone(), Some("test-user-123".into())).with_feed(mirror.clone());
    list.open().await.unwrap();

    let mut theirs = scenario_thread();
    theirs.id = "theirs".into();
    mirror.upsert(&MirrorRow::from_thread(&theirs, "someone-else")).await.unwrap();
    let mut mine = scenario_thread();
    mine.id = "mine".into();
    mirror.upsert(&MirrorRow::from_thread(&mine, "test-user-123")).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..50 {
        list.poll_changes().await.unwrap();
        ids = list.rows().iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        if ids.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ids, vec!["mine".to_string(), "t1".to_string()]);
    let owned: Vec<String> = mirror.list(Some("test-user-123")).await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(owned.len(), 2);
}
