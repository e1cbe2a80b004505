/// Event types reported back through a transport
use crate::action::Action;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Running,
    Success,
    Failure,
    Timeout,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Running => "running",
            State::Success => "success",
            State::Failure => "failure",
            State::Timeout => "timeout",
        }
    }

    /// Terminal states after which the rest of a batch should not run.
    pub fn aborts_batch(&self) -> bool {
        matches!(self, State::Failure | State::Timeout)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(State::Running),
            "success" => Ok(State::Success),
            "failure" => Ok(State::Failure),
            "timeout" => Ok(State::Timeout),
            other => Err(format!("unknown action state: {}", other)),
        }
    }
}

/// Status report for one action phase transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: Action,
    pub message: String,
    pub state: State,
}

impl Event {
    pub fn new(action: Action, state: State, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            state,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action: {}, message: {}, state: {}",
            self.action, self.message, self.state
        )
    }
}
