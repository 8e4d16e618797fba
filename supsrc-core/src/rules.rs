//! Rule engine (C4): pure predicates over state, no I/O.

use crate::state::RepositoryState;
use supsrc_config::Rule;

/// Does the current state satisfy this rule's trigger condition right now?
///
/// `Inactivity` never fires synchronously — it is timer-driven (see
/// `processor::EventProcessor`'s debounced timer). `Manual` never fires.
pub fn should_trigger(rule: &Rule, state: &RepositoryState) -> bool {
    match rule {
        Rule::SaveCount { count } => state.save_count >= *count,
        Rule::Inactivity { .. } => false,
        Rule::Manual => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RepositoryState;
    use std::time::Duration;
    use supsrc_config::DurationLiteral;

    fn state_with_save_count(n: u32) -> RepositoryState {
        let mut state = RepositoryState::new("r1".into());
        state.save_count = n;
        state
    }

    #[test]
    fn save_count_triggers_at_threshold() {
        let rule = Rule::SaveCount { count: 2 };
        assert!(!should_trigger(&rule, &state_with_save_count(1)));
        assert!(should_trigger(&rule, &state_with_save_count(2)));
        assert!(should_trigger(&rule, &state_with_save_count(3)));
    }

    #[test]
    fn inactivity_never_triggers_synchronously() {
        let rule = Rule::Inactivity {
            period: DurationLiteral(Duration::from_secs(30)),
        };
        assert!(!should_trigger(&rule, &state_with_save_count(100)));
    }

    #[test]
    fn manual_never_triggers() {
        assert!(!should_trigger(&Rule::Manual, &state_with_save_count(100)));
    }
}
