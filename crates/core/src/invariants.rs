//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible timer states during development.
//! These checks are compiled out in release builds.

use crate::models::{Team, TeamState};
use crate::session::Session;

/// Validate that a team's accounting is internally consistent
pub fn assert_team_invariants(team: &Team) {
    debug_assert!(
        team.time_left.is_finite() && team.time_left >= 0.0,
        "Team {} has invalid time left {}",
        team.name,
        team.time_left
    );

    debug_assert!(
        team.time_added >= 0.0 && team.time_subtracted >= 0.0,
        "Team {} has negative adjustment totals",
        team.name
    );

    debug_assert!(
        team.state != TeamState::Finished || team.finish_time.is_some(),
        "Team {} is finished without a finish time",
        team.name
    );

    debug_assert!(
        !matches!(team.state, TeamState::Running | TeamState::Paused) || team.start_time.is_some(),
        "Team {} is {} but was never started",
        team.name,
        team.state
    );
}

/// Validate that the owner is always privileged
pub fn assert_session_invariants(session: &Session) {
    debug_assert!(
        session.privileged().contains(&session.owner()),
        "Session {} owner {} is not privileged",
        session.id(),
        session.owner()
    );

    debug_assert!(
        !session.id().is_empty(),
        "Session has an empty id"
    );
}
