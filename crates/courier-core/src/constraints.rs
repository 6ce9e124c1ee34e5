use crate::config::DeviceState;
use serde::{Deserialize, Serialize};

/// Declarative gating predicate attached to a job. Keys are persisted with
/// the job record, so their wire names are stable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConstraintKey {
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "charging")]
    Charging,
    #[serde(rename = "migrations_complete")]
    MigrationsComplete,
}

impl ConstraintKey {
    pub fn is_met(self, state: &DeviceState) -> bool {
        match self {
            ConstraintKey::Network => state.network_available,
            ConstraintKey::Charging => state.charging,
            ConstraintKey::MigrationsComplete => !state.migrations_pending,
        }
    }
}

pub fn all_met(keys: &[ConstraintKey], state: &DeviceState) -> bool {
    keys.iter().all(|key| key.is_met(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_evaluate_against_state() {
        let state = DeviceState {
            network_available: false,
            charging: true,
            migrations_pending: true,
        };
        assert!(!ConstraintKey::Network.is_met(&state));
        assert!(ConstraintKey::Charging.is_met(&state));
        assert!(!ConstraintKey::MigrationsComplete.is_met(&state));
        assert!(all_met(&[], &state));
        assert!(!all_met(&[ConstraintKey::Charging, ConstraintKey::Network], &state));
    }

    #[test]
    fn keys_serialize_to_stable_names() {
        let json = serde_json::to_string(&ConstraintKey::MigrationsComplete).expect("encode");
        assert_eq!(json, "\"migrations_complete\"");
    }
}
