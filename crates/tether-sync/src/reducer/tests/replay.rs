use super::{canonical, run};
use crate::reducer::message::{DisplayData, ToolState};
use crate::reducer::state::{AgentTodoStatus, ReducerState};
use crate::test_utils::{agent_record, tool_call, tool_result, user_record};
use crate::wire::{AgentItem, UsageData};
use serde_json::json;

#[test]
fn user_message_appears_once() {
    let mut state = ReducerState::new();
    let out = run(&mut state, vec![user_record("r1", 100, "hello")]);
    assert_eq!(out.messages.len(), 1);
    match &out.messages[0].data {
        DisplayData::UserText { text, images } => {
            assert_eq!(text, "hello");
            assert!(images.is_empty());
        }
        other => panic!("expected user text, got {other:?}"),
    }

    let out = run(&mut state, vec![user_record("r1", 100, "hello")]);
    assert!(out.messages.is_empty());
    assert_eq!(state.message_count(), 1);
}

#[test]
fn local_id_dedups_server_echo_of_optimistic_send() {
    let mut state = ReducerState::new();
    let mut optimistic = user_record("local-1", 100, "ship it");
    optimistic.local_id = Some("tok-1".to_string());
    run(&mut state, vec![optimistic]);

    // The server's canonical copy of the same send: new record id, same
    // idempotency token.
    let mut canonical = user_record("srv-9", 105, "ship it");
    canonical.local_id = Some("tok-1".to_string());
    let out = run(&mut state, vec![canonical]);
    assert!(out.messages.is_empty());
    assert_eq!(state.message_count(), 1);
}

#[test]
fn agent_text_items_each_become_a_message() {
    let mut state = ReducerState::new();
    let record = agent_record(
        "r1",
        100,
        vec![
            AgentItem::Text {
                text: "first".to_string(),
            },
            AgentItem::Text {
                text: "second".to_string(),
            },
        ],
    );
    let out = run(&mut state, vec![record.clone()]);
    assert_eq!(out.messages.len(), 2);

    let out = run(&mut state, vec![record]);
    assert!(out.messages.is_empty());
    assert_eq!(state.message_count(), 2);
}

#[test]
fn tool_call_and_result_round_trip() {
    let mut state = ReducerState::new();
    run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_call("t1", "Bash", json!({"cmd": "ls"}))],
        )],
    );
    let out = run(
        &mut state,
        vec![agent_record(
            "r2",
            150,
            vec![tool_result("t1", json!("ok"), false)],
        )],
    );
    assert_eq!(out.messages.len(), 1);
    match &out.messages[0].data {
        DisplayData::ToolCall { tool, .. } => {
            assert_eq!(tool.state, ToolState::Completed);
            assert_eq!(tool.result, Some(json!("ok")));
            assert_eq!(tool.completed_at, Some(150));
        }
        other => panic!("expected tool call, got {other:?}"),
    }
}

#[test]
fn result_for_unknown_tool_is_dropped() {
    let mut state = ReducerState::new();
    let out = run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_result("nope", json!("ok"), false)],
        )],
    );
    assert!(out.messages.is_empty());
    assert_eq!(state.message_count(), 0);
}

#[test]
fn usage_snapshot_is_most_recent_wins() {
    let mut state = ReducerState::new();
    let mut newer = agent_record(
        "r1",
        200,
        vec![AgentItem::Text {
            text: "hi".to_string(),
        }],
    );
    newer.usage = Some(UsageData {
        input_tokens: 10,
        output_tokens: 20,
        ..UsageData::default()
    });
    let out = run(&mut state, vec![newer]);
    assert_eq!(out.usage.map(|u| u.input_tokens), Some(10));

    // An out-of-order older record must not regress the snapshot.
    let mut stale = agent_record(
        "r2",
        150,
        vec![AgentItem::Text {
            text: "old".to_string(),
        }],
    );
    stale.usage = Some(UsageData {
        input_tokens: 999,
        ..UsageData::default()
    });
    let out = run(&mut state, vec![stale]);
    assert!(out.usage.is_none());
    assert_eq!(state.latest_usage().input_tokens, 10);
    assert_eq!(state.latest_usage().timestamp, 200);
}

#[test]
fn task_tool_input_updates_todo_snapshot() {
    let mut state = ReducerState::new();
    let input = json!({
        "todos": [
            { "content": "write tests", "status": "in_progress" },
            { "content": "review", "status": "pending" }
        ]
    });
    let out = run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_call("t1", "TodoWrite", input)],
        )],
    );
    let todos = out.todos.expect("snapshot should update");
    assert_eq!(todos.todos.len(), 2);
    assert_eq!(todos.todos[0].status, AgentTodoStatus::InProgress);
    assert_eq!(todos.timestamp, 100);

    // A stale TodoWrite must not clobber the newer snapshot.
    let out = run(
        &mut state,
        vec![agent_record(
            "r2",
            50,
            vec![tool_call("t2", "TodoWrite", json!({ "todos": [] }))],
        )],
    );
    assert!(out.todos.is_none());
    assert_eq!(state.latest_todos().todos.len(), 2);
}

#[test]
fn batch_split_does_not_change_the_result() {
    let script = || {
        vec![
            user_record("r1", 100, "run ls"),
            agent_record(
                "r2",
                110,
                vec![
                    AgentItem::Text {
                        text: "sure".to_string(),
                    },
                    tool_call("t1", "Bash", json!({"cmd": "ls"})),
                ],
            ),
            agent_record("r3", 120, vec![tool_result("t1", json!("a b c"), false)]),
            user_record("r4", 130, "thanks"),
        ]
    };

    let mut whole = ReducerState::new();
    run(&mut whole, script());

    let mut split = ReducerState::new();
    for record in script() {
        run(&mut split, vec![record]);
    }

    assert_eq!(canonical(&whole), canonical(&split));
}
