use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::AddressState;

/// Why a task was not handed to the execution subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The client has no public address of the task's family.
    Unsupported,
    /// Executed from this address too recently; eligible again at `eligible_at`.
    CoolingDown { eligible_at: i64 },
}

/// Outcome of the admission policy for a single task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Admit,
    Skip(SkipReason),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// The policy was asked about a task it cannot decide on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyDefect {
    #[error("public address still unresolved when deciding")]
    UnresolvedAddress,
    #[error("negative re-execution interval ({0}s)")]
    NegativeCooldown(i64),
}

/// Pure admission rule.
///
/// `address` is the client's public address of the task's own family and
/// `last_execution` the latest execution of the task from exactly that address
/// (`None` if never). `now` must be coordinator time.
pub fn admission_policy(
    address: AddressState,
    last_execution: Option<i64>,
    now: i64,
    cooldown_secs: i64,
) -> Result<Decision, PolicyDefect> {
    if cooldown_secs < 0 {
        return Err(PolicyDefect::NegativeCooldown(cooldown_secs));
    }
    match address {
        AddressState::Unknown => Err(PolicyDefect::UnresolvedAddress),
        AddressState::Unsupported => Ok(Decision::Skip(SkipReason::Unsupported)),
        AddressState::Known(_) => match last_execution {
            Some(t) if t.saturating_add(cooldown_secs) > now => {
                Ok(Decision::Skip(SkipReason::CoolingDown {
                    eligible_at: t.saturating_add(cooldown_secs),
                }))
            }
            _ => Ok(Decision::Admit),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: i64 = 21_600;

    fn known() -> AddressState {
        AddressState::Known("198.51.100.4".parse().unwrap())
    }

    #[test]
    fn unsupported_is_skipped_regardless_of_history() {
        for last in [None, Some(0), Some(1_000_000)] {
            assert_eq!(
                admission_policy(AddressState::Unsupported, last, 2_000_000, COOLDOWN),
                Ok(Decision::Skip(SkipReason::Unsupported))
            );
        }
    }

    #[test]
    fn cooldown_boundary() {
        let now = 1_000_000;
        // t + cooldown == now: elapsed exactly, eligible.
        assert_eq!(
            admission_policy(known(), Some(now - COOLDOWN), now, COOLDOWN),
            Ok(Decision::Admit)
        );
        assert_eq!(
            admission_policy(known(), Some(now - COOLDOWN + 1), now, COOLDOWN),
            Ok(Decision::Skip(SkipReason::CoolingDown { eligible_at: now + 1 }))
        );
    }

    #[test]
    fn never_executed_is_admitted() {
        assert_eq!(admission_policy(known(), None, 0, COOLDOWN), Ok(Decision::Admit));
    }

    #[test]
    fn unresolved_address_is_a_defect() {
        assert_eq!(
            admission_policy(AddressState::Unknown, None, 0, COOLDOWN),
            Err(PolicyDefect::UnresolvedAddress)
        );
        assert_eq!(
            admission_policy(known(), None, 0, -1),
            Err(PolicyDefect::NegativeCooldown(-1))
        );
    }

    #[test]
    fn far_future_history_does_not_overflow() {
        assert!(!admission_policy(known(), Some(i64::MAX), 0, COOLDOWN)
            .unwrap()
            .is_admit());
    }
}
