//! Classification of provider state changes.

use touchline_sdk::objects::MatchState;

use crate::config::SyncSettings;

/// What a state notification means relative to the state we hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No change of activity class; reconcile facts only.
    Heartbeat,
    /// The match stopped being active. Announced after the grace window.
    Deactivated,
    /// The match became active again.
    Reactivated,
    /// Inactive to a different inactive state.
    Unexpected,
}

pub fn classify(old: MatchState, new: MatchState, settings: &SyncSettings) -> Transition {
    match (settings.is_active(old), settings.is_active(new)) {
        (true, true) => Transition::Heartbeat,
        (true, false) => Transition::Deactivated,
        (false, true) => Transition::Reactivated,
        (false, false) if old == new => Transition::Heartbeat,
        (false, false) => Transition::Unexpected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_with_default_table() {
        let settings = SyncSettings::default();
        assert_eq!(
            classify(MatchState::Live, MatchState::Live, &settings),
            Transition::Heartbeat
        );
        assert_eq!(
            classify(MatchState::Live, MatchState::Interrupted, &settings),
            Transition::Deactivated
        );
        assert_eq!(
            classify(MatchState::Interrupted, MatchState::Live, &settings),
            Transition::Reactivated
        );
        assert_eq!(
            classify(MatchState::NotStarted, MatchState::NotStarted, &settings),
            Transition::Heartbeat
        );
        assert_eq!(
            classify(MatchState::Interrupted, MatchState::Finished, &settings),
            Transition::Unexpected
        );
    }

    #[test]
    fn test_two_active_states_are_a_heartbeat() {
        let mut settings = SyncSettings::default();
        settings.active_states.insert(MatchState::Interrupted);
        assert_eq!(
            classify(MatchState::Live, MatchState::Interrupted, &settings),
            Transition::Heartbeat
        );
    }
}
