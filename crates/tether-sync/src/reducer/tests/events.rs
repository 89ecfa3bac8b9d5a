use super::run;
use crate::reducer::message::DisplayData;
use crate::reducer::state::ReducerState;
use crate::test_utils::{agent_record, event_record, tool_call, tool_result, user_record};
use crate::wire::AgentEvent;
use serde_json::json;

#[test]
fn ready_event_is_flagged_but_never_displayed() {
    let mut state = ReducerState::new();
    let out = run(&mut state, vec![event_record("r1", 100, AgentEvent::Ready)]);
    assert!(out.has_ready_event);
    assert!(out.messages.is_empty());
    assert_eq!(state.message_count(), 0);

    // Replaying the same record must not re-raise the flag.
    let out = run(&mut state, vec![event_record("r1", 100, AgentEvent::Ready)]);
    assert!(!out.has_ready_event);
}

#[test]
fn switch_event_becomes_a_message() {
    let mut state = ReducerState::new();
    let out = run(
        &mut state,
        vec![event_record(
            "r1",
            100,
            AgentEvent::Switch {
                mode: "plan".to_string(),
            },
        )],
    );
    assert_eq!(out.messages.len(), 1);
    assert!(matches!(
        &out.messages[0].data,
        DisplayData::AgentEvent {
            event: AgentEvent::Switch { mode }
        } if mode == "plan"
    ));
}

#[test]
fn context_reset_zeroes_todos_and_usage() {
    let mut state = ReducerState::new();
    run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_call(
                "t1",
                "TodoWrite",
                json!({"todos": [{"content": "x", "status": "pending"}]}),
            )],
        )],
    );
    assert_eq!(state.latest_todos().todos.len(), 1);

    let out = run(
        &mut state,
        vec![event_record(
            "r2",
            200,
            AgentEvent::Message {
                message: "Context was reset".to_string(),
            },
        )],
    );
    let todos = out.todos.expect("reset publishes an empty snapshot");
    assert!(todos.todos.is_empty());
    assert_eq!(todos.timestamp, 200);
    assert_eq!(out.usage.map(|u| u.timestamp), Some(200));
    // The reset still shows up in the transcript.
    assert_eq!(out.messages.len(), 1);
}

#[test]
fn compaction_resets_usage_but_not_todos() {
    let mut state = ReducerState::new();
    run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_call(
                "t1",
                "TodoWrite",
                json!({"todos": [{"content": "x", "status": "pending"}]}),
            )],
        )],
    );

    let out = run(
        &mut state,
        vec![event_record(
            "r2",
            200,
            AgentEvent::Message {
                message: "Compaction completed".to_string(),
            },
        )],
    );
    assert!(out.todos.is_none());
    assert_eq!(out.usage.map(|u| u.input_tokens), Some(0));
    assert_eq!(state.latest_todos().todos.len(), 1);
}

#[test]
fn command_echo_is_classified_as_event() {
    let mut state = ReducerState::new();
    let out = run(
        &mut state,
        vec![user_record(
            "r1",
            100,
            "<command-name>/compact</command-name>\n<command-args></command-args>",
        )],
    );
    assert_eq!(out.messages.len(), 1);
    assert!(matches!(
        &out.messages[0].data,
        DisplayData::AgentEvent {
            event: AgentEvent::Message { message }
        } if message == "/compact"
    ));
    // Consumed as an event; no user-text message exists.
    assert_eq!(state.message_count(), 1);
}

#[test]
fn plain_user_text_is_not_classified() {
    let mut state = ReducerState::new();
    let out = run(
        &mut state,
        vec![user_record("r1", 100, "tell me about <command-name>")],
    );
    assert_eq!(out.messages.len(), 1);
    assert!(matches!(&out.messages[0].data, DisplayData::UserText { .. }));
}

#[test]
fn usage_limit_signal_becomes_limit_event() {
    let mut state = ReducerState::new();
    let out = run(
        &mut state,
        vec![agent_record(
            "r1",
            100,
            vec![tool_result(
                "t-any",
                json!("Claude usage limit reached|1767225600"),
                true,
            )],
        )],
    );
    assert_eq!(out.messages.len(), 1);
    assert!(matches!(
        &out.messages[0].data,
        DisplayData::AgentEvent {
            event: AgentEvent::LimitReached {
                resets_at: Some(1_767_225_600)
            }
        }
    ));
}
