//! Match state synchronizer settings.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use touchline_sdk::objects::MatchState;

/// Mapping of provider state codes and the active/inactive split.
///
/// The provider does not document its full state enum, so both the code
/// table and the set of active states come from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Provider state code → match state.
    #[serde(with = "state_code_table")]
    pub state_codes: BTreeMap<i32, MatchState>,
    pub active_states: HashSet<MatchState>,
    /// How long an active→inactive change is held back before it is
    /// announced, in case the match resumes.
    #[serde(with = "duration_secs", rename = "inactive_grace_secs")]
    pub inactive_grace: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            state_codes: BTreeMap::from([
                (1, MatchState::NotStarted),
                (2, MatchState::Live),
                (3, MatchState::Interrupted),
                (4, MatchState::Finished),
                (5, MatchState::Cancelled),
            ]),
            active_states: HashSet::from([MatchState::Live]),
            inactive_grace: Duration::from_secs(120),
        }
    }
}

impl SyncSettings {
    pub fn resolve(&self, code: i32) -> Option<MatchState> {
        self.state_codes.get(&code).copied()
    }

    pub fn is_active(&self, state: MatchState) -> bool {
        self.active_states.contains(&state)
    }

    /// States counted as active, for SQL filters.
    pub fn active_state_list(&self) -> Vec<MatchState> {
        let mut states: Vec<_> = self.active_states.iter().copied().collect();
        states.sort_by_key(|s| *s as u8);
        states
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// TOML table keys are strings; codes are parsed from them.
mod state_code_table {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use touchline_sdk::objects::MatchState;

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<i32, MatchState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(code, state)| (code.to_string(), *state))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<i32, MatchState>, D::Error> {
        BTreeMap::<String, MatchState>::deserialize(deserializer)?
            .into_iter()
            .map(|(code, state)| {
                code.parse::<i32>()
                    .map(|code| (code, state))
                    .map_err(|_| D::Error::custom(format!("invalid state code `{code}`")))
            })
            .collect()
    }
}
