mod events;
mod property;
mod replay;

use crate::reducer::state::ReducerState;
use crate::reducer::{ReduceOutput, reduce};
use crate::wire::NormalizedMessage;

fn run(state: &mut ReducerState, batch: Vec<NormalizedMessage>) -> ReduceOutput {
    reduce(state, batch, None)
}

/// Content snapshot of the whole arena, independent of allocation order.
///
/// Internal ids depend on which phase first touched a record, which varies
/// with batch boundaries; convergence is about the rendered content, so ids
/// are stripped and the remainder sorted.
fn canonical(state: &ReducerState) -> Vec<String> {
    let mut out: Vec<String> = state
        .messages_snapshot()
        .into_iter()
        .map(|m| {
            let mut value = serde_json::to_value(m).unwrap();
            strip_ids(&mut value);
            value.to_string()
        })
        .collect();
    out.sort();
    out
}

fn strip_ids(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("id");
            for v in map.values_mut() {
                strip_ids(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                strip_ids(v);
            }
        }
        _ => {}
    }
}
