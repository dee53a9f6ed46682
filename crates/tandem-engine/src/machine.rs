//! The session state machine.
//!
//! Every mutation re-reads the session, validates against the stored
//! definition and writes back with a compare-and-set on the status or state
//! version. A lost race is retried from a fresh read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use tandem_core::definition::{ActionSpec, Effect, ParamKind, PhaseDef, SessionDefinition};
use tandem_core::ids::{SessionId, UserId};
use tandem_core::session::{ControlMode, PrizeAward, SessionStatus};
use tandem_store::session_logs::SessionLogRepo;
use tandem_store::sessions::{ParticipantRow, SessionRepo, SessionRow};
use tandem_store::Database;

use crate::effects::apply_effects;
use crate::error::EngineError;
use crate::expr::{self, Scope};
use crate::prizes::distribute;
use crate::roles::assign_roles;
use crate::view::{self, SessionView};

const MAX_CONFLICT_RETRIES: usize = 5;

/// Something participants should hear about.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined {
        user_id: UserId,
    },
    ParticipantLeft {
        user_id: UserId,
    },
    Started {
        phase: String,
    },
    PhaseTransition {
        from: Option<String>,
        to: String,
    },
    /// State, phase or status changed; every participant needs a fresh view.
    StateChanged,
    Finished {
        winning_role: Option<String>,
        winners: Vec<UserId>,
        prizes: Vec<PrizeAward>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutcome {
    Accepted { events: Vec<SessionEvent> },
    Rejected { reason: String },
}

impl ActionOutcome {
    fn rejected(reason: impl Into<String>) -> Result<Self, EngineError> {
        Ok(Self::Rejected {
            reason: reason.into(),
        })
    }
}

/// Time left on the current phase of an active session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTimer {
    pub phase: String,
    pub remaining: Duration,
}

/// What happens to the session after a state change.
enum Resolution {
    Stay,
    Advance { to: String },
    Finish { winning_role: Option<String> },
}

pub struct SessionEngine {
    sessions: SessionRepo,
    logs: SessionLogRepo,
}

impl SessionEngine {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            logs: SessionLogRepo::new(db),
        }
    }

    pub fn create(
        &self,
        definition: &SessionDefinition,
        host: &UserId,
    ) -> Result<SessionRow, EngineError> {
        definition.validate()?;
        check_expressions(definition)?;
        let session = self.sessions.create(definition, host)?;
        info!(session_id = %session.id, definition = %definition.name, host_id = %host, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, EngineError> {
        Ok(self.sessions.get(id)?)
    }

    pub fn participants(&self, id: &SessionId) -> Result<Vec<ParticipantRow>, EngineError> {
        Ok(self.sessions.participants(id)?)
    }

    pub fn participant(
        &self,
        id: &SessionId,
        user_id: &UserId,
    ) -> Result<Option<ParticipantRow>, EngineError> {
        Ok(self.sessions.participant(id, user_id)?)
    }

    pub fn join(&self, id: &SessionId, user_id: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        let session = self.sessions.get(id)?;
        if session.status != SessionStatus::Waiting {
            return Err(EngineError::InvalidState(format!(
                "session is {}, joining is closed",
                session.status
            )));
        }
        if self.sessions.participant(id, user_id)?.is_some() {
            return Err(EngineError::InvalidState("already joined".into()));
        }
        match self
            .sessions
            .add_participant(id, user_id, session.definition.max_players)
        {
            Ok(_) => {}
            Err(tandem_store::StoreError::Conflict(reason)) => {
                return Err(EngineError::InvalidState(reason));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(session_id = %id, user_id = %user_id, "participant joined");
        Ok(vec![SessionEvent::ParticipantJoined {
            user_id: user_id.clone(),
        }])
    }

    /// Waiting sessions drop the seat; afterwards the seat (and role) is kept
    /// and only marked disconnected.
    pub fn leave(&self, id: &SessionId, user_id: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        let session = self.sessions.get(id)?;
        if self.sessions.participant(id, user_id)?.is_none() {
            return Err(EngineError::NotFound(format!("participant {user_id}")));
        }
        if session.status == SessionStatus::Waiting {
            self.sessions.remove_participant(id, user_id)?;
        } else {
            self.sessions.set_connected(id, user_id, false)?;
        }
        Ok(vec![SessionEvent::ParticipantLeft {
            user_id: user_id.clone(),
        }])
    }

    pub fn start(&self, id: &SessionId, requested_by: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        self.start_with_rng(id, requested_by, &mut rand::thread_rng())
    }

    pub fn start_with_rng<R: Rng>(
        &self,
        id: &SessionId,
        requested_by: &UserId,
        rng: &mut R,
    ) -> Result<Vec<SessionEvent>, EngineError> {
        let (first, assignments) = retry_on_conflict(|| {
            let session = self.sessions.get(id)?;
            require_host(&session, requested_by, "start")?;
            if session.status != SessionStatus::Waiting {
                return Err(EngineError::InvalidState(format!("session is {}", session.status)));
            }

            let definition = &session.definition;
            let participants = self.sessions.participants(id)?;
            let count = participants.len();
            if count < definition.min_players || count > definition.max_players {
                return Err(EngineError::InvalidState(format!(
                    "need {}-{} players, have {count}",
                    definition.min_players, definition.max_players
                )));
            }
            let minimums: usize = definition.roles.iter().map(|r| r.min_count).sum();
            if count < minimums {
                return Err(EngineError::InvalidState(format!(
                    "roles need at least {minimums} players, have {count}"
                )));
            }
            let first = definition
                .first_phase()
                .ok_or_else(|| EngineError::InvalidDefinition("no phases".into()))?
                .name
                .clone();

            let seats: Vec<UserId> = participants.into_iter().map(|p| p.user_id).collect();
            let assignments = assign_roles(definition, &seats, &mut *rng);
            self.sessions.start(id, &first, &session.state, &assignments)?;
            Ok((first, assignments))
        })?;
        let count = assignments.len();

        let roles: Map<String, Value> = assignments
            .iter()
            .map(|(user, role)| (user.to_string(), Value::String(role.clone())))
            .collect();
        self.logs.append(id, "session_started", &json!({ "phase": first, "roles": roles }))?;
        info!(session_id = %id, phase = %first, players = count, "session started");

        Ok(vec![
            SessionEvent::Started { phase: first.clone() },
            SessionEvent::PhaseTransition { from: None, to: first },
            SessionEvent::StateChanged,
        ])
    }

    /// Validate and apply an action. Rejections are reported in the outcome
    /// and leave the stored session untouched.
    pub fn process_action(
        &self,
        id: &SessionId,
        user_id: &UserId,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, EngineError> {
        let outcome = retry_on_conflict(|| self.try_action(id, user_id, action, params))?;
        if let ActionOutcome::Rejected { reason } = &outcome {
            debug!(session_id = %id, user_id = %user_id, action, reason = %reason, "action rejected");
        }
        Ok(outcome)
    }

    fn try_action(
        &self,
        id: &SessionId,
        user_id: &UserId,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, EngineError> {
        let session = self.sessions.get(id)?;
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Paused => return ActionOutcome::rejected("session is paused"),
            SessionStatus::Waiting => return ActionOutcome::rejected("session has not started"),
            SessionStatus::Finished => return ActionOutcome::rejected("session is finished"),
        }

        let Some(participant) = self.sessions.participant(id, user_id)? else {
            return ActionOutcome::rejected("not a participant in this session");
        };
        let definition = &session.definition;
        let Some(spec) = definition.action(action) else {
            return ActionOutcome::rejected(format!("unknown action '{action}'"));
        };
        let Some(role_name) = participant.role.as_deref() else {
            return ActionOutcome::rejected("no role assigned");
        };
        let Some(role) = definition.role(role_name) else {
            return ActionOutcome::rejected(format!("unknown role '{role_name}'"));
        };
        if !role.available_actions.iter().any(|a| a == action) {
            return ActionOutcome::rejected(format!("role '{role_name}' cannot perform '{action}'"));
        }
        let (phase_name, phase) = current_phase(&session)?;
        if !phase.allowed_actions.iter().any(|a| a == action) {
            return ActionOutcome::rejected(format!(
                "'{action}' is not allowed during phase '{phase_name}'"
            ));
        }
        if let Some(roles) = &spec.roles {
            if !roles.iter().any(|r| r == role_name) {
                return ActionOutcome::rejected(format!("'{action}' is restricted to {}", roles.join(", ")));
            }
        }
        if let Some(phases) = &spec.phases {
            if !phases.iter().any(|p| p == phase_name) {
                return ActionOutcome::rejected(format!(
                    "'{action}' is only allowed during {}",
                    phases.join(", ")
                ));
            }
        }
        let params = match validate_params(spec, params) {
            Ok(params) => params,
            Err(reason) => return ActionOutcome::rejected(reason),
        };

        let participants = self.sessions.participants(id)?;
        let scope = Scope {
            params: Some(&params),
            actor: Some((user_id, role_name)),
            phase: Some(phase_name),
            players: participants.len(),
        };
        let next_state = match apply_effects(&session.state, &spec.effects, &scope) {
            Ok(state) => state,
            Err(e) => return ActionOutcome::rejected(format!("'{action}' failed: {e}")),
        };

        let resolution = resolve(definition, phase, &next_state, &scope);
        self.persist(&session, &next_state, &resolution)?;

        self.logs.append(
            id,
            "action",
            &json!({
                "userId": user_id,
                "role": role_name,
                "phase": phase_name,
                "action": action,
                "params": params,
            }),
        )?;
        let events = self.settle(&session, &participants, resolution, "action")?;
        Ok(ActionOutcome::Accepted { events })
    }

    /// A phase timer fired. Stale timers (phase already left, session paused
    /// or finished) do nothing.
    pub fn on_phase_timer(&self, id: &SessionId, phase: &str) -> Result<Vec<SessionEvent>, EngineError> {
        retry_on_conflict(|| {
            let session = self.sessions.get(id)?;
            if session.status != SessionStatus::Active || session.current_phase.as_deref() != Some(phase) {
                return Ok(Vec::new());
            }
            let (_, phase_def) = current_phase(&session)?;
            let participants = self.sessions.participants(id)?;
            let scope = Scope {
                phase: Some(phase),
                players: participants.len(),
                ..Scope::default()
            };
            let resolution = match winning_role(&session.definition, &session.state, &scope) {
                Some(role) => Resolution::Finish {
                    winning_role: Some(role),
                },
                None => advance(phase_def),
            };
            self.persist(&session, &session.state, &resolution)?;
            self.settle(&session, &participants, resolution, "timer")
        })
    }

    pub fn pause(&self, id: &SessionId, requested_by: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        let session = self.sessions.get(id)?;
        require_host(&session, requested_by, "pause")?;
        self.sessions.pause(id)?;
        info!(session_id = %id, "session paused");
        Ok(vec![SessionEvent::StateChanged])
    }

    /// The phase clock is shifted by the paused interval so a timed phase
    /// only has its remaining time left.
    pub fn resume(&self, id: &SessionId, requested_by: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        let session = self.sessions.get(id)?;
        require_host(&session, requested_by, "resume")?;
        if session.status != SessionStatus::Paused {
            return Err(EngineError::InvalidState(format!("session is {}", session.status)));
        }

        let now = Utc::now();
        let started = session.phase_started_at.as_deref().and_then(parse_time);
        let paused = session.paused_at.as_deref().and_then(parse_time);
        let shifted = match (started, paused) {
            (Some(started), Some(paused)) if paused > started => started + (now - paused),
            _ => now,
        };
        self.sessions.resume(id, &shifted.to_rfc3339())?;
        info!(session_id = %id, "session resumed");
        Ok(vec![SessionEvent::StateChanged])
    }

    /// End the session without winners or prizes.
    pub fn delete(&self, id: &SessionId, requested_by: &UserId) -> Result<Vec<SessionEvent>, EngineError> {
        let session = self.sessions.get(id)?;
        require_host(&session, requested_by, "delete")?;
        if session.status.is_terminal() {
            return Err(EngineError::InvalidState("session is already finished".into()));
        }
        self.sessions.finish(id, &session.state, None)?;
        self.logs
            .append(id, "session_finished", &json!({ "reason": "deleted", "winners": [] }))?;
        info!(session_id = %id, "session deleted");
        Ok(vec![
            SessionEvent::StateChanged,
            SessionEvent::Finished {
                winning_role: None,
                winners: Vec::new(),
                prizes: Vec::new(),
            },
        ])
    }

    pub fn set_control_mode(
        &self,
        id: &SessionId,
        user_id: &UserId,
        mode: ControlMode,
    ) -> Result<(), EngineError> {
        if !self.sessions.set_control_mode(id, user_id, mode)? {
            return Err(EngineError::NotFound(format!("participant {user_id}")));
        }
        debug!(session_id = %id, user_id = %user_id, mode = %mode, "control mode changed");
        Ok(())
    }

    pub fn set_connected(&self, id: &SessionId, user_id: &UserId, connected: bool) -> Result<(), EngineError> {
        self.sessions.set_connected(id, user_id, connected)?;
        Ok(())
    }

    /// What `user_id` may see of the session. The host sees the full state
    /// even without a seat; other outsiders see nothing.
    pub fn view_for(&self, id: &SessionId, user_id: &UserId) -> Result<SessionView, EngineError> {
        let session = self.sessions.get(id)?;
        match self.sessions.participant(id, user_id)? {
            Some(p) => Ok(view::session_view(&session, p.role.as_deref())),
            None if session.host_id == *user_id => Ok(view::session_view(&session, None)),
            None => Err(EngineError::Forbidden("not a participant in this session".into())),
        }
    }

    /// Time left on the current phase, if it is timed and the session active.
    pub fn phase_timer(session: &SessionRow) -> Option<PhaseTimer> {
        if session.status != SessionStatus::Active {
            return None;
        }
        let phase = session.current_phase.as_deref()?;
        let secs = session.definition.phase(phase)?.duration_secs?;
        let started = session
            .phase_started_at
            .as_deref()
            .and_then(parse_time)
            .unwrap_or_else(Utc::now);
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        Some(PhaseTimer {
            phase: phase.to_string(),
            remaining: Duration::from_secs(secs).saturating_sub(elapsed),
        })
    }

    fn persist(
        &self,
        session: &SessionRow,
        state: &Map<String, Value>,
        resolution: &Resolution,
    ) -> Result<(), EngineError> {
        let phase = session.current_phase.as_deref().unwrap_or_default();
        match resolution {
            Resolution::Stay => {
                self.sessions
                    .save_progress(&session.id, session.version, phase, state, false)?;
            }
            Resolution::Advance { to } => {
                self.sessions
                    .save_progress(&session.id, session.version, to, state, true)?;
            }
            Resolution::Finish { .. } => {
                self.sessions.finish(&session.id, state, Some(session.version))?;
            }
        }
        Ok(())
    }

    /// Log and describe a resolution that has been persisted.
    fn settle(
        &self,
        session: &SessionRow,
        participants: &[ParticipantRow],
        resolution: Resolution,
        cause: &str,
    ) -> Result<Vec<SessionEvent>, EngineError> {
        let id = &session.id;
        let from = session.current_phase.clone();
        let mut events = vec![SessionEvent::StateChanged];

        match resolution {
            Resolution::Stay => {}
            Resolution::Advance { to } => {
                self.logs.append(
                    id,
                    "phase_transition",
                    &json!({ "from": from, "to": to, "cause": cause }),
                )?;
                info!(session_id = %id, from = ?from, to = %to, cause, "phase transition");
                events.push(SessionEvent::PhaseTransition { from, to });
            }
            Resolution::Finish { winning_role } => {
                let winners: Vec<UserId> = match &winning_role {
                    Some(role) => participants
                        .iter()
                        .filter(|p| p.role.as_deref() == Some(role.as_str()))
                        .map(|p| p.user_id.clone())
                        .collect(),
                    None => Vec::new(),
                };
                let prizes = distribute(&session.definition.prize, &winners);
                self.logs.append(
                    id,
                    "session_finished",
                    &json!({
                        "reason": if winning_role.is_some() { "win" } else { "terminal_phase" },
                        "cause": cause,
                        "winningRole": winning_role,
                        "winners": winners,
                        "prizes": prizes,
                    }),
                )?;
                info!(session_id = %id, winning_role = ?winning_role, winners = winners.len(), "session finished");
                events.push(SessionEvent::Finished {
                    winning_role,
                    winners,
                    prizes,
                });
            }
        }
        Ok(events)
    }
}

fn retry_on_conflict<T>(mut attempt: impl FnMut() -> Result<T, EngineError>) -> Result<T, EngineError> {
    let mut retries = 0;
    loop {
        match attempt() {
            Err(EngineError::Conflict(reason)) if retries < MAX_CONFLICT_RETRIES => {
                retries += 1;
                debug!(retries, reason = %reason, "concurrent session write, retrying");
            }
            other => return other,
        }
    }
}

fn require_host(session: &SessionRow, user_id: &UserId, what: &str) -> Result<(), EngineError> {
    if session.host_id != *user_id {
        return Err(EngineError::Forbidden(format!("only the host can {what} the session")));
    }
    Ok(())
}

fn current_phase(session: &SessionRow) -> Result<(&str, &PhaseDef), EngineError> {
    let name = session
        .current_phase
        .as_deref()
        .ok_or_else(|| EngineError::InvalidState(format!("session {} has no phase", session.id)))?;
    let phase = session
        .definition
        .phase(name)
        .ok_or_else(|| EngineError::InvalidState(format!("unknown phase '{name}'")))?;
    Ok((name, phase))
}

/// Keep declared parameters only; reject missing required ones and type
/// mismatches.
fn validate_params(spec: &ActionSpec, params: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    let mut out = Map::new();
    for (name, param) in &spec.params {
        match params.get(name) {
            None | Some(Value::Null) if param.required => {
                return Err(format!("missing parameter '{name}'"));
            }
            None | Some(Value::Null) => {}
            Some(value) if !param.kind.accepts(value) => {
                return Err(format!("parameter '{name}' must be {}", kind_name(param.kind)));
            }
            Some(value) => {
                out.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(out)
}

fn kind_name(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::String => "a string",
        ParamKind::Number => "a number",
        ParamKind::Boolean => "a boolean",
        ParamKind::Array => "an array",
        ParamKind::Object => "an object",
        ParamKind::Any => "a value",
    }
}

/// First win condition (definition order) that holds.
fn winning_role(definition: &SessionDefinition, state: &Map<String, Value>, scope: &Scope<'_>) -> Option<String> {
    let bound = scope.bind(state);
    definition
        .win_conditions
        .iter()
        .find(|win| condition_holds(&win.condition, &bound))
        .map(|win| win.role.clone())
}

fn resolve(
    definition: &SessionDefinition,
    phase: &PhaseDef,
    state: &Map<String, Value>,
    scope: &Scope<'_>,
) -> Resolution {
    if let Some(role) = winning_role(definition, state, scope) {
        return Resolution::Finish {
            winning_role: Some(role),
        };
    }
    match &phase.transition {
        Some(condition) if condition_holds(condition, &scope.bind(state)) => advance(phase),
        _ => Resolution::Stay,
    }
}

fn advance(phase: &PhaseDef) -> Resolution {
    match &phase.next {
        Some(next) => Resolution::Advance { to: next.clone() },
        None => Resolution::Finish { winning_role: None },
    }
}

fn condition_holds(condition: &str, scope: &Value) -> bool {
    match expr::evaluate(condition, scope) {
        Ok(value) => expr::truthy(&value),
        Err(e) => {
            warn!(condition, error = %e, "condition failed to evaluate");
            false
        }
    }
}

/// Reject definitions whose expressions do not parse.
fn check_expressions(definition: &SessionDefinition) -> Result<(), EngineError> {
    for phase in &definition.phases {
        if let Some(condition) = &phase.transition {
            expr::parse(condition).map_err(|e| EngineError::expression(&phase.name, e))?;
        }
    }
    for win in &definition.win_conditions {
        expr::parse(&win.condition).map_err(|e| EngineError::expression(&win.role, e))?;
    }
    for action in &definition.actions {
        for effect in &action.effects {
            expr::parse(effect.path()).map_err(|e| EngineError::expression(&action.name, e))?;
            let value = match effect {
                Effect::Set { value, .. }
                | Effect::Add { value, .. }
                | Effect::Push { value, .. }
                | Effect::Merge { value, .. } => Some(value),
                Effect::Remove { value, .. } => value.as_ref(),
            };
            if let Some(value) = value {
                expr::parse(value).map_err(|e| EngineError::expression(&action.name, e))?;
            }
        }
    }
    Ok(())
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tandem_store::session_logs::SessionLogRepo;

    fn definition() -> SessionDefinition {
        serde_json::from_value(json!({
            "name": "relay",
            "minPlayers": 2,
            "maxPlayers": 3,
            "roles": [
                {"name": "red", "visibleState": ["round"], "availableActions": ["score", "pass"],
                 "minCount": 1, "maxCount": 1},
                {"name": "blue", "visibleState": ["round", "scores"], "availableActions": ["score"],
                 "minCount": 1}
            ],
            "phases": [
                {"name": "play", "allowedActions": ["score"], "transition": "state.round >= 2", "next": "final"},
                {"name": "final", "allowedActions": ["score", "pass"], "durationSecs": 30}
            ],
            "actions": [
                {"name": "score", "params": {"points": {"type": "number"}}, "effects": [
                    {"op": "add", "path": "round", "value": "1"},
                    {"op": "add", "path": "scores[actor.role]", "value": "params.points"}
                ]},
                {"name": "pass"}
            ],
            "winConditions": [{"role": "blue", "condition": "state.scores.blue >= 10"}],
            "prize": {"pool": 100, "split": {"kind": "equal"}},
            "initialState": {"round": 0, "scores": {}}
        }))
        .unwrap()
    }

    struct Fixture {
        engine: SessionEngine,
        logs: SessionLogRepo,
        id: SessionId,
        host: UserId,
    }

    impl Fixture {
        fn role_holder(&self, role: &str) -> UserId {
            self.engine
                .participants(&self.id)
                .unwrap()
                .into_iter()
                .find(|p| p.role.as_deref() == Some(role))
                .map(|p| p.user_id)
                .unwrap()
        }

        fn act(&self, user: &UserId, action: &str, params: Value) -> ActionOutcome {
            let params = params.as_object().cloned().unwrap_or_default();
            self.engine.process_action(&self.id, user, action, &params).unwrap()
        }

        fn log_kinds(&self) -> Vec<String> {
            self.logs.list(&self.id).unwrap().into_iter().map(|l| l.kind).collect()
        }
    }

    fn waiting() -> Fixture {
        let db = Database::in_memory().unwrap();
        let engine = SessionEngine::new(db.clone());
        let host = UserId::from_raw("host");
        let session = engine.create(&definition(), &host).unwrap();
        Fixture {
            engine,
            logs: SessionLogRepo::new(db),
            id: session.id,
            host,
        }
    }

    fn started() -> Fixture {
        let f = waiting();
        for user in ["a", "b"] {
            f.engine.join(&f.id, &UserId::from_raw(user)).unwrap();
        }
        f.engine
            .start_with_rng(&f.id, &f.host, &mut StdRng::seed_from_u64(3))
            .unwrap();
        f
    }

    #[test]
    fn host_starts_with_distinct_roles_and_first_phase() {
        let f = waiting();
        let (a, b) = (UserId::from_raw("a"), UserId::from_raw("b"));
        f.engine.join(&f.id, &a).unwrap();
        assert!(matches!(f.engine.start(&f.id, &f.host), Err(EngineError::InvalidState(_))));
        f.engine.join(&f.id, &b).unwrap();
        assert!(matches!(f.engine.start(&f.id, &a), Err(EngineError::Forbidden(_))));

        let events = f.engine.start(&f.id, &f.host).unwrap();
        assert!(events.contains(&SessionEvent::Started { phase: "play".into() }));

        let session = f.engine.get(&f.id).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_phase.as_deref(), Some("play"));

        let mut roles: Vec<String> = f
            .engine
            .participants(&f.id)
            .unwrap()
            .into_iter()
            .map(|p| p.role.unwrap())
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["blue", "red"]);

        assert!(matches!(f.engine.start(&f.id, &f.host), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn start_refuses_when_role_minimums_cannot_be_filled() {
        let db = Database::in_memory().unwrap();
        let engine = SessionEngine::new(db.clone());
        let host = UserId::from_raw("host");

        let mut def = definition();
        def.min_players = 1;
        def.roles[1].min_count = 2;
        assert!(def.validate().is_err());
        let session = SessionRepo::new(db).create(&def, &host).unwrap();

        for user in ["a", "b"] {
            engine.join(&session.id, &UserId::from_raw(user)).unwrap();
        }
        let refused = engine.start(&session.id, &host);
        assert!(matches!(refused, Err(EngineError::InvalidState(msg)) if msg.contains("at least 3")));
        assert_eq!(engine.get(&session.id).unwrap().status, SessionStatus::Waiting);
        assert!(engine.participants(&session.id).unwrap().iter().all(|p| p.role.is_none()));

        engine.join(&session.id, &UserId::from_raw("c")).unwrap();
        engine.start(&session.id, &host).unwrap();
        let participants = engine.participants(&session.id).unwrap();
        let blues = participants.iter().filter(|p| p.role.as_deref() == Some("blue")).count();
        assert_eq!(blues, 2);
    }

    #[test]
    fn joining_is_bounded_and_closes_at_start() {
        let f = waiting();
        for user in ["a", "b", "c"] {
            f.engine.join(&f.id, &UserId::from_raw(user)).unwrap();
        }
        let full = f.engine.join(&f.id, &UserId::from_raw("d"));
        assert!(matches!(full, Err(EngineError::InvalidState(msg)) if msg.contains("full")));

        f.engine.leave(&f.id, &UserId::from_raw("c")).unwrap();
        assert_eq!(f.engine.participants(&f.id).unwrap().len(), 2);

        f.engine.start(&f.id, &f.host).unwrap();
        assert!(matches!(
            f.engine.join(&f.id, &UserId::from_raw("d")),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn rejected_actions_leave_state_untouched() {
        let f = started();
        let red = f.role_holder("red");
        let blue = f.role_holder("blue");
        let before = f.engine.get(&f.id).unwrap();

        let cases = [
            (red.clone(), "pass", json!({}), "not allowed during phase"),
            (blue.clone(), "pass", json!({}), "cannot perform"),
            (blue.clone(), "fly", json!({}), "unknown action"),
            (blue.clone(), "score", json!({}), "missing parameter"),
            (blue.clone(), "score", json!({"points": "ten"}), "must be a number"),
            (UserId::from_raw("stranger"), "score", json!({"points": 1}), "not a participant"),
        ];
        for (user, action, params, expected) in cases {
            match f.act(&user, action, params) {
                ActionOutcome::Rejected { reason } => {
                    assert!(reason.contains(expected), "{reason} should mention {expected}")
                }
                other => panic!("{action} should be rejected, got {other:?}"),
            }
        }

        let after = f.engine.get(&f.id).unwrap();
        assert_eq!(
            serde_json::to_string(&after.state).unwrap(),
            serde_json::to_string(&before.state).unwrap()
        );
        assert_eq!(after.version, before.version);
        assert!(!f.log_kinds().contains(&"action".to_string()));
    }

    #[test]
    fn accepted_actions_apply_effects_and_advance_phase() {
        let f = started();
        let blue = f.role_holder("blue");

        let outcome = f.act(&blue, "score", json!({"points": 3}));
        assert_eq!(outcome, ActionOutcome::Accepted { events: vec![SessionEvent::StateChanged] });
        let session = f.engine.get(&f.id).unwrap();
        assert_eq!(session.state["round"], 1);
        assert_eq!(session.state["scores"]["blue"], 3);

        let ActionOutcome::Accepted { events } = f.act(&blue, "score", json!({"points": 1})) else {
            panic!("second score rejected");
        };
        assert!(events.contains(&SessionEvent::PhaseTransition {
            from: Some("play".into()),
            to: "final".into(),
        }));
        assert_eq!(f.engine.get(&f.id).unwrap().current_phase.as_deref(), Some("final"));
        assert_eq!(
            f.log_kinds(),
            vec!["session_started", "action", "action", "phase_transition"]
        );
    }

    #[test]
    fn win_condition_finishes_with_prizes() {
        let f = started();
        let blue = f.role_holder("blue");

        let ActionOutcome::Accepted { events } = f.act(&blue, "score", json!({"points": 12})) else {
            panic!("score rejected");
        };
        let finished = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::Finished { winning_role, winners, prizes } => {
                    Some((winning_role.clone(), winners.clone(), prizes.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.0.as_deref(), Some("blue"));
        assert_eq!(finished.1, vec![blue.clone()]);
        assert_eq!(finished.2, vec![PrizeAward { user_id: blue.clone(), amount: 100 }]);

        assert_eq!(f.engine.get(&f.id).unwrap().status, SessionStatus::Finished);
        assert!(matches!(
            f.act(&blue, "score", json!({"points": 1})),
            ActionOutcome::Rejected { .. }
        ));
        assert_eq!(f.log_kinds().last().map(String::as_str), Some("session_finished"));
    }

    #[test]
    fn timer_on_terminal_phase_finishes_without_winners() {
        let f = started();
        let blue = f.role_holder("blue");
        f.act(&blue, "score", json!({"points": 1}));
        f.act(&blue, "score", json!({"points": 1}));

        // Stale timer for a phase already left.
        assert!(f.engine.on_phase_timer(&f.id, "play").unwrap().is_empty());

        let timer = SessionEngine::phase_timer(&f.engine.get(&f.id).unwrap()).unwrap();
        assert_eq!(timer.phase, "final");
        assert!(timer.remaining <= Duration::from_secs(30));

        let events = f.engine.on_phase_timer(&f.id, "final").unwrap();
        assert!(events.contains(&SessionEvent::Finished {
            winning_role: None,
            winners: Vec::new(),
            prizes: Vec::new(),
        }));
        assert_eq!(f.engine.get(&f.id).unwrap().status, SessionStatus::Finished);
    }

    #[test]
    fn pause_blocks_actions_and_timers() {
        let f = started();
        let blue = f.role_holder("blue");
        let red = f.role_holder("red");

        assert!(matches!(f.engine.pause(&f.id, &red), Err(EngineError::Forbidden(_))));
        f.engine.pause(&f.id, &f.host).unwrap();
        assert!(matches!(
            f.act(&blue, "score", json!({"points": 1})),
            ActionOutcome::Rejected { reason } if reason.contains("paused")
        ));
        assert!(f.engine.on_phase_timer(&f.id, "play").unwrap().is_empty());
        assert!(SessionEngine::phase_timer(&f.engine.get(&f.id).unwrap()).is_none());

        f.engine.resume(&f.id, &f.host).unwrap();
        assert!(matches!(f.engine.resume(&f.id, &f.host), Err(EngineError::InvalidState(_))));
        assert!(matches!(
            f.act(&blue, "score", json!({"points": 1})),
            ActionOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn delete_finishes_without_prizes() {
        let f = waiting();
        assert!(matches!(
            f.engine.delete(&f.id, &UserId::from_raw("a")),
            Err(EngineError::Forbidden(_))
        ));
        let events = f.engine.delete(&f.id, &f.host).unwrap();
        assert!(events.contains(&SessionEvent::Finished {
            winning_role: None,
            winners: Vec::new(),
            prizes: Vec::new(),
        }));
        assert_eq!(f.engine.get(&f.id).unwrap().status, SessionStatus::Finished);
        assert!(matches!(f.engine.delete(&f.id, &f.host), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn views_are_role_filtered() {
        let f = started();
        let red = f.role_holder("red");
        let blue = f.role_holder("blue");
        f.act(&blue, "score", json!({"points": 2}));

        let red_view = f.engine.view_for(&f.id, &red).unwrap();
        assert_eq!(red_view.role.as_deref(), Some("red"));
        assert_eq!(Value::Object(red_view.state), json!({"round": 1}));

        let blue_view = f.engine.view_for(&f.id, &blue).unwrap();
        assert_eq!(blue_view.state["scores"]["blue"], 2);

        let host_view = f.engine.view_for(&f.id, &f.host).unwrap();
        assert!(host_view.role.is_none());
        assert!(host_view.state.contains_key("scores"));

        assert!(matches!(
            f.engine.view_for(&f.id, &UserId::from_raw("stranger")),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn control_mode_requires_a_seat() {
        let f = started();
        let red = f.role_holder("red");
        f.engine.set_control_mode(&f.id, &red, ControlMode::Agent).unwrap();
        assert_eq!(
            f.engine.participant(&f.id, &red).unwrap().unwrap().control_mode,
            ControlMode::Agent
        );
        assert!(matches!(
            f.engine.set_control_mode(&f.id, &UserId::from_raw("x"), ControlMode::Human),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn create_rejects_bad_definitions() {
        let engine = SessionEngine::new(Database::in_memory().unwrap());
        let host = UserId::from_raw("host");

        let mut broken = definition();
        broken.phases[0].transition = Some("state.round >=".into());
        assert!(matches!(
            engine.create(&broken, &host),
            Err(EngineError::InvalidDefinition(_))
        ));

        let mut bounds = definition();
        bounds.min_players = 5;
        assert!(matches!(
            engine.create(&bounds, &host),
            Err(EngineError::InvalidDefinition(_))
        ));

        engine.create(&definition(), &host).unwrap();
        assert!(matches!(
            engine.create(&definition(), &host),
            Err(EngineError::Conflict(_))
        ));
    }
}
