use std::fmt::Display;

use tracing::{info, warn};

use super::AgentState;
use crate::dataplane::Dataplane;
use crate::metrics::ServerMetrics;
use crate::policy::PolicyState;
use crate::{Error, Result};

impl AgentState {
    /// Replaces the configured generation with the pending one. The previous
    /// generation is torn down best effort, then the new one is built in
    /// dependency order. Failsafe policies replaced since the last resync are
    /// released once nothing is built on them. A failed build leaves the
    /// generation half applied and needs a fresh resync.
    pub(super) fn apply_pending_state(&mut self, dp: &dyn Dataplane) -> Result<()> {
        let previous = self.store.swap();
        teardown(dp, previous, &self.metrics);
        self.rebuild(dp)?;
        self.baseline.release_retired(dp);
        let configured = self.store.configured();
        info!(
            ipsets = configured.ipsets.len(),
            policies = configured.policies.len(),
            profiles = configured.profiles.len(),
            workload_endpoints = configured.workload_endpoints.len(),
            host_endpoints = configured.host_endpoints.len(),
            "applied pending state"
        );
        Ok(())
    }

    fn rebuild(&mut self, dp: &dyn Dataplane) -> Result<()> {
        let host = self.baseline.host_policies();
        let state = self.store.current(false);

        for (name, ipset) in state.ipsets.iter_mut() {
            ipset.create(dp).map_err(failed("ipset", name))?;
        }
        {
            let lookup = PolicyState::ipset_lookup(&state.ipsets);
            for (name, profile) in state.profiles.iter_mut() {
                profile
                    .create(dp, &lookup)
                    .map_err(failed("profile", name))?;
            }
            for (id, policy) in state.policies.iter_mut() {
                policy.create(dp, &lookup).map_err(failed("policy", id))?;
            }
        }

        let (index, weps, heps) = state.split_endpoints();
        for (id, wep) in weps.iter_mut() {
            if let Some(sw_if_index) = self.endpoints.get(id) {
                wep.create(dp, *sw_if_index, index)
                    .map_err(failed("workload endpoint", id))?;
            }
        }
        for (id, hep) in heps.iter_mut() {
            hep.create(dp, index, host)
                .map_err(failed("host endpoint", id))?;
        }
        Ok(())
    }
}

fn failed(kind: &str, id: impl Display) -> impl FnOnce(Error) -> Error {
    let entity = format!("{kind} {id}");
    move |e| Error::Reconcile {
        entity,
        source: Box::new(e),
    }
}

fn teardown(dp: &dyn Dataplane, mut previous: PolicyState, metrics: &ServerMetrics) {
    let check = |kind: &str, id: &dyn Display, result: Result<()>| {
        if let Err(e) = result {
            warn!(%id, "failed to delete {kind}: {e}");
            metrics.teardown_errors.inc();
        }
    };
    for (id, wep) in previous.workload_endpoints.iter_mut() {
        check("workload endpoint", id, wep.delete(dp));
    }
    for (id, policy) in previous.policies.iter_mut() {
        check("policy", id, policy.delete(dp));
    }
    for (name, profile) in previous.profiles.iter_mut() {
        check("profile", name, profile.delete(dp));
    }
    for (name, ipset) in previous.ipsets.iter_mut() {
        check("ipset", name, ipset.delete(dp));
    }
    for (id, hep) in previous.host_endpoints.iter_mut() {
        check("host endpoint", id, hep.delete(dp));
    }
}
