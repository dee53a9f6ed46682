//! Static configuration a session is instantiated from.
//!
//! A definition is supplied as JSON when the session is created and stored with it.
//! Condition and effect strings are expressions evaluated by the engine.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDefinition {
    pub name: String,
    pub min_players: usize,
    pub max_players: usize,
    pub roles: Vec<RoleDef>,
    pub phases: Vec<PhaseDef>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub win_conditions: Vec<WinCondition>,
    #[serde(default)]
    pub prize: PrizeRule,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDef {
    pub name: String,
    /// Top-level state keys this role may observe.
    #[serde(default)]
    pub visible_state: Vec<String>,
    #[serde(default)]
    pub available_actions: Vec<String>,
    #[serde(default)]
    pub min_count: usize,
    #[serde(default)]
    pub max_count: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDef {
    pub name: String,
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Condition that advances the phase when true.
    #[serde(default)]
    pub transition: Option<String>,
    /// Phase entered on transition. `None` marks a terminal phase.
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub phases: Option<Vec<String>>,
    #[serde(default)]
    pub effects: Vec<Effect>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamKind {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// A single state mutation. `path` is a dotted path into the shared state and
/// `value` an expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Effect {
    Set { path: String, value: String },
    Add { path: String, value: String },
    Push { path: String, value: String },
    Remove {
        path: String,
        #[serde(default)]
        value: Option<String>,
    },
    Merge { path: String, value: String },
}

impl Effect {
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. }
            | Self::Add { path, .. }
            | Self::Push { path, .. }
            | Self::Remove { path, .. }
            | Self::Merge { path, .. } => path,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinCondition {
    pub role: String,
    pub condition: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrizeRule {
    #[serde(default)]
    pub pool: u64,
    #[serde(default)]
    pub split: PrizeSplit,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrizeSplit {
    #[default]
    Equal,
    /// Shares in percent, handed out to winners in seat order.
    Percentages { shares: Vec<u32> },
    WinnerTakesAll,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition has no phases")]
    NoPhases,
    #[error("definition has no roles")]
    NoRoles,
    #[error("invalid player bounds: min {min}, max {max}")]
    PlayerBounds { min: usize, max: usize },
    #[error("duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("{owner} references unknown {kind}: {name}")]
    UnknownReference {
        owner: String,
        kind: &'static str,
        name: String,
    },
    #[error("role {role}: minCount {min} exceeds maxCount {max}")]
    RoleBounds { role: String, min: usize, max: usize },
    #[error("role minimums ({total}) exceed minPlayers ({min})")]
    MinimumsExceedPlayers { total: usize, min: usize },
    #[error("prize percentages must sum to 100, got {0}")]
    PrizeShares(u64),
}

impl SessionDefinition {
    pub fn role(&self, name: &str) -> Option<&RoleDef> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn first_phase(&self) -> Option<&PhaseDef> {
        self.phases.first()
    }

    /// Structural checks. Expression syntax is checked by the engine.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.phases.is_empty() {
            return Err(DefinitionError::NoPhases);
        }
        if self.roles.is_empty() {
            return Err(DefinitionError::NoRoles);
        }
        if self.min_players == 0 || self.min_players > self.max_players {
            return Err(DefinitionError::PlayerBounds {
                min: self.min_players,
                max: self.max_players,
            });
        }

        unique("role", self.roles.iter().map(|r| r.name.as_str()))?;
        unique("phase", self.phases.iter().map(|p| p.name.as_str()))?;
        unique("action", self.actions.iter().map(|a| a.name.as_str()))?;

        for role in &self.roles {
            if let Some(max) = role.max_count {
                if role.min_count > max {
                    return Err(DefinitionError::RoleBounds {
                        role: role.name.clone(),
                        min: role.min_count,
                        max,
                    });
                }
            }
            for action in &role.available_actions {
                self.require_action(&role.name, action)?;
            }
        }

        let total_min: usize = self.roles.iter().map(|r| r.min_count).sum();
        if total_min > self.min_players {
            return Err(DefinitionError::MinimumsExceedPlayers {
                total: total_min,
                min: self.min_players,
            });
        }

        for phase in &self.phases {
            for action in &phase.allowed_actions {
                self.require_action(&phase.name, action)?;
            }
            if let Some(next) = &phase.next {
                if self.phase(next).is_none() {
                    return Err(unknown(&phase.name, "phase", next));
                }
            }
        }

        for action in &self.actions {
            for role in action.roles.iter().flatten() {
                if self.role(role).is_none() {
                    return Err(unknown(&action.name, "role", role));
                }
            }
            for phase in action.phases.iter().flatten() {
                if self.phase(phase).is_none() {
                    return Err(unknown(&action.name, "phase", phase));
                }
            }
        }

        for win in &self.win_conditions {
            if self.role(&win.role).is_none() {
                return Err(unknown("win condition", "role", &win.role));
            }
        }

        if let PrizeSplit::Percentages { shares } = &self.prize.split {
            let total: u64 = shares.iter().map(|s| u64::from(*s)).sum();
            if total != 100 {
                return Err(DefinitionError::PrizeShares(total));
            }
        }

        Ok(())
    }

    fn require_action(&self, owner: &str, action: &str) -> Result<(), DefinitionError> {
        if self.action(action).is_none() {
            return Err(unknown(owner, "action", action));
        }
        Ok(())
    }
}

fn unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> Result<(), DefinitionError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DefinitionError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn unknown(owner: &str, kind: &'static str, name: &str) -> DefinitionError {
    DefinitionError::UnknownReference {
        owner: owner.to_string(),
        kind,
        name: name.to_string(),
    }
}
