use serde::Serialize;
use serde_json::{Map, Value};

use tandem_core::definition::SessionDefinition;
use tandem_core::ids::SessionId;
use tandem_core::session::SessionStatus;
use tandem_store::sessions::SessionRow;

/// A participant's picture of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub phase: Option<String>,
    pub role: Option<String>,
    pub state: Map<String, Value>,
}

pub fn session_view(session: &SessionRow, role: Option<&str>) -> SessionView {
    SessionView {
        session_id: session.id.clone(),
        status: session.status,
        phase: session.current_phase.clone(),
        role: role.map(str::to_string),
        state: filter_state(&session.state, role, session.status, &session.definition),
    }
}

/// The part of `state` a participant with `role` may see.
///
/// Waiting sessions and role-less participants see everything. Once roles are
/// assigned only allowlisted top-level keys survive; an unknown role sees
/// nothing.
pub fn filter_state(
    state: &Map<String, Value>,
    role: Option<&str>,
    status: SessionStatus,
    definition: &SessionDefinition,
) -> Map<String, Value> {
    let Some(role) = role else {
        return state.clone();
    };
    if status == SessionStatus::Waiting {
        return state.clone();
    }
    let Some(role) = definition.role(role) else {
        return Map::new();
    };

    role.visible_state
        .iter()
        .filter_map(|key| state.get(key).map(|v| (key.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> SessionDefinition {
        serde_json::from_value(json!({
            "name": "werewolf",
            "minPlayers": 2,
            "maxPlayers": 6,
            "roles": [
                {"name": "wolf", "visibleState": ["day", "wolves", "ghost"]},
                {"name": "villager", "visibleState": ["day"]}
            ],
            "phases": [{"name": "night"}]
        }))
        .unwrap()
    }

    fn state() -> Map<String, Value> {
        json!({"day": 2, "wolves": ["u1"], "seer_notes": "u3 is good"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn only_allowlisted_keys_survive() {
        let def = definition();
        for status in [SessionStatus::Active, SessionStatus::Paused, SessionStatus::Finished] {
            let wolf = filter_state(&state(), Some("wolf"), status, &def);
            assert_eq!(Value::Object(wolf), json!({"day": 2, "wolves": ["u1"]}));

            let villager = filter_state(&state(), Some("villager"), status, &def);
            assert!(villager.keys().all(|k| k == "day"));
        }
    }

    #[test]
    fn waiting_or_roleless_sees_everything() {
        let def = definition();
        assert_eq!(filter_state(&state(), Some("villager"), SessionStatus::Waiting, &def), state());
        assert_eq!(filter_state(&state(), None, SessionStatus::Active, &def), state());
    }

    #[test]
    fn unknown_role_sees_nothing() {
        let filtered = filter_state(&state(), Some("ghost"), SessionStatus::Active, &definition());
        assert!(filtered.is_empty());
    }
}
