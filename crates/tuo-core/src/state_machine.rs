//! Upgrade state machine
//!
//! Happy path is strictly ordered; any active state may exit to `failed`,
//! and `failed` may only move on to `rolled_back`.

use crate::error::UpgradeError;
use crate::session::UpgradeState;

/// Validates a state transition
///
/// # Errors
/// Returns [`UpgradeError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_transition(from: UpgradeState, to: UpgradeState) -> Result<(), UpgradeError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(UpgradeError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: UpgradeState) -> Vec<UpgradeState> {
    use UpgradeState::*;
    match from {
        Starting => vec![BackingUp, Failed],
        BackingUp => vec![Upgrading, Failed],
        Upgrading => vec![Migrating, Failed],
        Migrating => vec![Restoring, Failed],
        Restoring => vec![Finalizing, Failed],
        Finalizing => vec![Completed, Failed],
        Failed => vec![RolledBack],
        Completed | RolledBack => vec![],
    }
}

fn allowed(from: UpgradeState, to: UpgradeState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [UpgradeState; 9] = [
        UpgradeState::Starting,
        UpgradeState::BackingUp,
        UpgradeState::Upgrading,
        UpgradeState::Migrating,
        UpgradeState::Restoring,
        UpgradeState::Finalizing,
        UpgradeState::Completed,
        UpgradeState::Failed,
        UpgradeState::RolledBack,
    ];

    fn any_state() -> impl Strategy<Value = UpgradeState> {
        prop::sample::select(ALL.to_vec())
    }

    #[test]
    fn happy_path_is_valid() {
        for pair in UpgradeState::HAPPY_PATH.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok());
        }
    }

    #[test]
    fn no_skipping() {
        assert!(validate_transition(UpgradeState::Starting, UpgradeState::Upgrading).is_err());
        assert!(validate_transition(UpgradeState::Migrating, UpgradeState::Completed).is_err());
    }

    #[test]
    fn rollback_only_from_failed() {
        assert!(validate_transition(UpgradeState::Failed, UpgradeState::RolledBack).is_ok());
        assert!(validate_transition(UpgradeState::Migrating, UpgradeState::RolledBack).is_err());
    }

    proptest! {
        #[test]
        fn prop_every_active_state_can_fail(state in any_state()) {
            let can_fail = validate_transition(state, UpgradeState::Failed).is_ok();
            prop_assert_eq!(can_fail, state.is_active());
        }

        #[test]
        fn prop_terminal_states_are_sinks(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(validate_transition(from, to).is_err());
            }
        }

        #[test]
        fn prop_progress_never_decreases(from in any_state(), to in any_state()) {
            if validate_transition(from, to).is_ok() {
                if let (Some(a), Some(b)) = (from.progress(), to.progress()) {
                    prop_assert!(a <= b);
                }
            }
        }
    }
}
