use serde::{Deserialize, Serialize};

/// Id of one client sharing a persistence area.
pub type ClientId = String;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed conclusively yet.
    /// Listeners wait for server data in this state.
    Unknown,
    /// The watch stream received data. Snapshots reflect the backend.
    Online,
    /// Connecting failed. Listeners are served from cache immediately.
    Offline,
}

/// Who reported an online state change. Secondary clients take the state
/// reported by the primary through the shared client state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

/// Sync state of a target as mirrored between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Lifecycle of a mutation batch as mirrored between clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_states_use_kebab_case() {
        assert_eq!(
            serde_json::to_string(&QueryTargetState::NotCurrent).unwrap(),
            "\"not-current\""
        );
        assert_eq!(
            serde_json::from_str::<MutationBatchState>("\"acknowledged\"").unwrap(),
            MutationBatchState::Acknowledged
        );
    }
}
