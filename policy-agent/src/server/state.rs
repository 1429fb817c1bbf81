use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::HashMap;

use crate::baseline::Baseline;
use crate::config::NodeConfig;
use crate::dataplane::SwIfIndex;
use crate::metrics::ServerMetrics;
use crate::policy::{PolicyStore, WorkloadEndpointId};
use crate::{Error, Result};

/// Phase of the policy engine connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Disconnected,
    Connected,
    Syncing,
    InSync,
}

impl Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Everything the control loop and attach/detach share, behind one lock.
pub(crate) struct AgentState {
    pub sync: SyncState,
    pub store: PolicyStore,
    /// Interfaces of attached workloads. Survives policy engine restarts.
    pub endpoints: HashMap<WorkloadEndpointId, SwIfIndex>,
    pub baseline: Baseline,
    /// Tunnel interfaces currently reported by the routing side.
    pub tunnels: BTreeSet<SwIfIndex>,
    pub uplink_taps: BTreeMap<SwIfIndex, SwIfIndex>,
    pub config: NodeConfig,
    pub metrics: ServerMetrics,
}

impl AgentState {
    /// Whether entity updates go to the pending generation. Entity updates are
    /// only valid while syncing or in sync.
    pub fn pending(&self) -> Result<bool> {
        match self.sync {
            SyncState::Syncing => Ok(true),
            SyncState::InSync => Ok(false),
            state => Err(Error::Protocol(format!(
                "entity update received in state {state}"
            ))),
        }
    }

    pub fn in_sync(&self) -> bool {
        self.sync == SyncState::InSync
    }
}

/// Locks the shared state, ignoring poisoning.
pub(crate) fn lock(state: &Mutex<AgentState>) -> MutexGuard<'_, AgentState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
impl AgentState {
    /// State over `dp` with the default test node configuration.
    pub(crate) fn for_test(dp: &dyn crate::dataplane::Dataplane) -> Self {
        let config = NodeConfig::default();
        let uplink_taps =
            super::interfaces::map_uplinks_to_taps(dp, &config.uplink_tag_prefix, &config.tap_tag_prefix)
                .unwrap();
        Self {
            sync: SyncState::Disconnected,
            store: PolicyStore::new(),
            endpoints: HashMap::default(),
            baseline: Baseline::install(dp, &config).unwrap(),
            tunnels: BTreeSet::new(),
            uplink_taps,
            config,
            metrics: ServerMetrics::default(),
        }
    }
}
