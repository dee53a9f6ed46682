//! Fixtures shared by the server's unit tests.

use std::time::Duration;

use serde_json::{json, Value};

use tandem_core::definition::SessionDefinition;

use crate::registry::{Outbound, Outbox};

/// Two roles, a timed opening phase and an untimed showdown.
///
/// `scout` only sees the round counter; `captain` also sees the scores.
pub(crate) fn definition() -> SessionDefinition {
    serde_json::from_value(definition_json()).unwrap()
}

pub(crate) fn definition_json() -> Value {
    json!({
        "name": "showdown",
        "minPlayers": 2,
        "maxPlayers": 4,
        "roles": [
            {"name": "scout", "visibleState": ["round"], "availableActions": ["score", "pass"], "minCount": 1, "maxCount": 1},
            {"name": "captain", "visibleState": ["round", "scores"], "availableActions": ["score"], "minCount": 1}
        ],
        "phases": [
            {"name": "play", "allowedActions": ["score"], "durationSecs": 60, "transition": "state.round >= 3", "next": "showdown"},
            {"name": "showdown", "allowedActions": ["score", "pass"]}
        ],
        "actions": [
            {"name": "score", "params": {"points": {"type": "number"}}, "effects": [
                {"op": "add", "path": "round", "value": "1"},
                {"op": "add", "path": "scores[actor.role]", "value": "params.points"}
            ]},
            {"name": "pass"}
        ],
        "winConditions": [{"role": "captain", "condition": "state.scores.captain >= 10"}],
        "prize": {"pool": 100, "split": {"kind": "equal"}},
        "initialState": {"round": 0, "scores": {}}
    })
}

/// Next text frame as JSON, failing the test after five seconds.
pub(crate) async fn next_json(out: &mut Outbox) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("timed out waiting for frame");
    match frame {
        Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Every text frame already queued.
pub(crate) fn drain_json(out: &mut Outbox) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = out.try_recv() {
        if let Outbound::Text(text) = frame {
            frames.push(serde_json::from_str(&text).unwrap());
        }
    }
    frames
}
