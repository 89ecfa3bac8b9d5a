use super::{canonical, run};
use crate::reducer::state::ReducerState;
use crate::test_utils::{agent_record, tool_call, tool_result, user_record};
use crate::wire::{AgentItem, NormalizedMessage};
use proptest::prelude::*;
use serde_json::json;

fn script() -> Vec<NormalizedMessage> {
    let mut root = agent_record(
        "root-1",
        115,
        vec![AgentItem::SidechainRoot {
            tool_use_id: "t1".to_string(),
            prompt: "dig in".to_string(),
        }],
    );
    root.is_sidechain = true;
    root.uuid = Some("u1".to_string());

    let mut child = agent_record(
        "c1",
        118,
        vec![AgentItem::Text {
            text: "found the cause".to_string(),
        }],
    );
    child.is_sidechain = true;
    child.uuid = Some("u2".to_string());
    child.parent_uuid = Some("u1".to_string());

    vec![
        user_record("r1", 100, "why is the build red?"),
        agent_record(
            "r2",
            110,
            vec![
                AgentItem::Text {
                    text: "checking".to_string(),
                },
                tool_call("t1", "Task", json!({"prompt": "dig in"})),
            ],
        ),
        root,
        child,
        agent_record("r5", 125, vec![tool_result("t1", json!("a flaky test"), false)]),
        user_record("r6", 130, "fix it"),
    ]
}

proptest! {
    /// Feeding the same record stream in any batch split, optionally
    /// replaying the whole stream afterwards, converges to the same
    /// rendered content.
    #[test]
    fn batch_splits_and_replay_converge(
        splits in proptest::collection::vec(any::<bool>(), 6),
        replay: bool,
    ) {
        let mut reference = ReducerState::new();
        run(&mut reference, script());
        let expected = canonical(&reference);

        let mut state = ReducerState::new();
        let mut batch = Vec::new();
        for (record, split) in script().into_iter().zip(splits) {
            batch.push(record);
            if split {
                run(&mut state, std::mem::take(&mut batch));
            }
        }
        run(&mut state, batch);
        if replay {
            run(&mut state, script());
        }

        prop_assert_eq!(canonical(&state), expected);
        prop_assert_eq!(state.message_count(), reference.message_count());
    }
}
