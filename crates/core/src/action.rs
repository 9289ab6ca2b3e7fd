//! Remote command envelope and action parsing
//!
//! A command names a verb, an optional parameter and the team indices it
//! targets. The verb may also carry its parameter inline (`add:30`,
//! `speed:0.5`), which is how older controllers send it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Speed;

/// Command as received from a controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    /// Indices outside the team list are ignored one by one
    #[serde(default)]
    pub team_indices: Vec<i64>,
}

impl Command {
    pub fn new(verb: impl Into<String>, team_indices: Vec<i64>) -> Self {
        Self {
            verb: verb.into(),
            parameter: None,
            team_indices,
        }
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameter = Some(parameter.into());
        self
    }

    /// Indices that address an existing team, in command order
    pub fn targets(&self, team_count: usize) -> impl Iterator<Item = usize> + '_ {
        self.team_indices
            .iter()
            .filter_map(move |&i| usize::try_from(i).ok().filter(|i| *i < team_count))
    }

    pub fn action(&self) -> Result<Action> {
        match self.verb.split_once(':') {
            Some((verb, inline)) => Action::parse(verb, Some(self.parameter.as_deref().unwrap_or(inline))),
            None => Action::parse(&self.verb, self.parameter.as_deref()),
        }
    }
}

/// A parsed timer action
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Start,
    /// Paused teams only
    Unpause,
    Pause,
    Finish,
    Rearm,
    /// Signed seconds, never zero
    AddTime(i64),
    SetSpeed(Speed),
}

impl Action {
    pub fn parse(verb: &str, parameter: Option<&str>) -> Result<Self> {
        match verb {
            "start" => Ok(Action::Start),
            "unpause" => Ok(Action::Unpause),
            "pause" => Ok(Action::Pause),
            "finish" => Ok(Action::Finish),
            "rearm" => Ok(Action::Rearm),
            "add" => {
                // Unparseable and zero are the same thing here
                let seconds = parameter.and_then(leading_int).unwrap_or(0);
                if seconds == 0 {
                    return Err(Error::InvalidParameter("Invalid seconds to add".into()));
                }
                Ok(Action::AddTime(seconds))
            }
            "speed" => {
                let value = parameter.and_then(leading_float).unwrap_or(f64::NAN);
                Speed::try_from(value)
                    .map(Action::SetSpeed)
                    .map_err(|_| Error::InvalidParameter("Invalid speed".into()))
            }
            other => Err(Error::InvalidParameter(format!("Unknown action: {}", other))),
        }
    }

    /// Past-tense description used in the audit log
    pub fn describe(&self) -> String {
        match self {
            Action::Start => "started teams".into(),
            Action::Unpause => "unpaused teams".into(),
            Action::Pause => "paused teams".into(),
            Action::Finish => "finished teams".into(),
            Action::Rearm => "rearmed teams".into(),
            Action::AddTime(seconds) => format!("added time: {}s to teams", seconds),
            Action::SetSpeed(speed) => format!("set speed: {} to teams", speed),
        }
    }

    /// Human-readable result of a successful dispatch
    pub fn message(&self) -> &'static str {
        match self {
            Action::Start => "Teams started",
            Action::Unpause => "Teams unpaused",
            Action::Pause => "Teams paused",
            Action::Finish => "Teams finished",
            Action::Rearm => "Teams rearmed",
            Action::AddTime(_) => "Teams time modified",
            Action::SetSpeed(_) => "Teams speed set",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => f.write_str("start"),
            Action::Unpause => f.write_str("unpause"),
            Action::Pause => f.write_str("pause"),
            Action::Finish => f.write_str("finish"),
            Action::Rearm => f.write_str("rearm"),
            Action::AddTime(seconds) => write!(f, "add:{}", seconds),
            Action::SetSpeed(speed) => write!(f, "speed:{}", speed.factor()),
        }
    }
}

/// Integer prefix of `s` (`"30s"` -> 30), like a lenient `parseInt`
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let end = numeric_prefix_len(s, false);
    s[..end].parse().ok()
}

/// Decimal prefix of `s` (`"0.5x"` -> 0.5)
fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let end = numeric_prefix_len(s, true);
    s[..end].parse().ok()
}

fn numeric_prefix_len(s: &str, allow_fraction: bool) -> usize {
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if allow_fraction && !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_verbs() {
        assert_eq!(Command::new("start", vec![0]).action().unwrap(), Action::Start);
        assert_eq!(Command::new("pause", vec![]).action().unwrap(), Action::Pause);
        assert_eq!(Command::new("rearm", vec![]).action().unwrap(), Action::Rearm);
    }

    #[test]
    fn test_inline_and_separate_parameters() {
        assert_eq!(Command::new("add:-30", vec![0]).action().unwrap(), Action::AddTime(-30));
        assert_eq!(
            Command::new("add", vec![0]).with_parameter("45").action().unwrap(),
            Action::AddTime(45)
        );
        assert_eq!(
            Command::new("speed:0.5", vec![0]).action().unwrap(),
            Action::SetSpeed(Speed::Half)
        );
    }

    #[test]
    fn test_add_is_permissive_but_rejects_zero() {
        assert_eq!(Action::parse("add", Some("30abc")).unwrap(), Action::AddTime(30));
        assert_eq!(Action::parse("add", Some(" +7")).unwrap(), Action::AddTime(7));
        assert!(matches!(Action::parse("add", Some("0")), Err(Error::InvalidParameter(_))));
        assert!(matches!(Action::parse("add", Some("abc")), Err(Error::InvalidParameter(_))));
        assert!(matches!(Action::parse("add", None), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_speed_must_be_allowed_value() {
        assert_eq!(Action::parse("speed", Some("4")).unwrap(), Action::SetSpeed(Speed::Quadruple));
        assert!(matches!(Action::parse("speed", Some("3")), Err(Error::InvalidParameter(_))));
        assert!(matches!(Action::parse("speed", Some("fast")), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_unknown_verb() {
        assert!(matches!(Action::parse("explode", None), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_targets_skip_out_of_range() {
        let cmd = Command::new("start", vec![0, 5, -1, 1]);
        let targets: Vec<usize> = cmd.targets(2).collect();
        assert_eq!(targets, vec![0, 1]);
    }

    #[test]
    fn test_envelope_wire_format() {
        let cmd: Command = serde_json::from_str(r#"{"verb":"add","parameter":"10","teamIndices":[1]}"#).unwrap();
        assert_eq!(cmd.team_indices, vec![1]);
        assert_eq!(cmd.action().unwrap(), Action::AddTime(10));
    }
}
