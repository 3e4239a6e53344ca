use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Data-driven finite-state machine shared by the thread-type and
/// task-status features. The engine itself knows nothing about sessions;
/// instances are configured with a state set and a transition table.
pub struct StateMachine<S> {
    name: &'static str,
    states: Vec<S>,
    transitions: HashMap<S, Vec<S>>,
    initial: S,
}

/// Result of a single transition attempt. Never persisted here; callers
/// decide whether to record it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome<S> {
    pub success: bool,
    pub from: S,
    pub to: S,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub noop: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
}

impl<S: Copy + Eq + Hash + Display> StateMachine<S> {
    /// Build a machine from its configuration. A transition table that
    /// references unknown states, or an initial state outside the state
    /// set, is a programming error and fails construction.
    pub fn new(
        name: &'static str,
        states: Vec<S>,
        transitions: HashMap<S, Vec<S>>,
        initial: S,
    ) -> Result<Self> {
        if states.is_empty() {
            return Err(anyhow!("state machine '{name}' has no states"));
        }
        if !states.contains(&initial) {
            return Err(anyhow!(
                "state machine '{name}': initial state '{initial}' is not in the state set"
            ));
        }
        for (from, targets) in &transitions {
            if !states.contains(from) {
                return Err(anyhow!(
                    "state machine '{name}': transition source '{from}' is not in the state set"
                ));
            }
            for to in targets {
                if !states.contains(to) {
                    return Err(anyhow!(
                        "state machine '{name}': transition target '{to}' (from '{from}') is not in the state set"
                    ));
                }
            }
        }
        Ok(Self {
            name,
            states,
            transitions,
            initial,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    pub fn is_valid_state(&self, state: S) -> bool {
        self.states.contains(&state)
    }

    /// Same-state transitions are always valid no-ops, even for states with
    /// no outgoing edges (terminal states).
    pub fn is_valid_transition(&self, from: S, to: S) -> bool {
        if !self.is_valid_state(from) || !self.is_valid_state(to) {
            return false;
        }
        if from == to {
            return true;
        }
        self.transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Allowed targets from `from`, for UI/help surfaces. Unknown states
    /// and terminal states yield an empty list.
    pub fn valid_transitions(&self, from: S) -> Vec<S> {
        self.transitions.get(&from).cloned().unwrap_or_default()
    }

    pub fn transition(&self, from: S, to: S, force: bool) -> TransitionOutcome<S> {
        if !self.is_valid_state(from) {
            return self.failure(from, to, format!("unknown source state '{from}'"));
        }
        if !self.is_valid_state(to) {
            return self.failure(from, to, format!("unknown target state '{to}'"));
        }
        if from == to {
            return TransitionOutcome {
                success: true,
                from,
                to,
                error: None,
                noop: true,
                forced: false,
            };
        }
        if self.is_valid_transition(from, to) {
            return TransitionOutcome {
                success: true,
                from,
                to,
                error: None,
                noop: false,
                forced: false,
            };
        }
        if force {
            log::warn!(
                "{}: forcing disallowed transition {from} -> {to}",
                self.name
            );
            return TransitionOutcome {
                success: true,
                from,
                to,
                error: None,
                noop: false,
                forced: true,
            };
        }
        let allowed = self
            .valid_transitions(from)
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.failure(
            from,
            to,
            format!("transition {from} -> {to} is not allowed; valid targets from '{from}': [{allowed}]"),
        )
    }

    fn failure(&self, from: S, to: S, detail: String) -> TransitionOutcome<S> {
        let states = self
            .states
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        TransitionOutcome {
            success: false,
            from,
            to,
            error: Some(format!("{}: {detail} (states: [{states}])", self.name)),
            noop: false,
            forced: false,
        }
    }

    /// Mermaid state diagram of the configured transitions, for docs.
    pub fn diagram(&self) -> String {
        let mut out = String::from("stateDiagram-v2\n");
        out.push_str(&format!("    [*] --> {}\n", self.initial));
        let mut states: Vec<&S> = self.transitions.keys().collect();
        states.sort_by_key(|s| s.to_string());
        for from in states {
            for to in &self.transitions[from] {
                out.push_str(&format!("    {from} --> {to}\n"));
            }
        }
        out
    }
}
