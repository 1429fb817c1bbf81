//! In-memory model of the policy engine's desired state.
//!
//! A [`PolicyState`] holds one generation of every entity kind. The
//! [`PolicyStore`] owns the configured generation, whose entities carry
//! dataplane handles, and the pending generation that buffers updates during
//! a resync and never touches the dataplane.

mod host;
mod ids;
mod ipset;
mod rule;
mod ruleset;
mod workload;

use ahash::HashMap;
use policy_agent_api::proto;

pub use host::{HostEndpoint, HostPolicies};
pub use ids::{HostEndpointId, PolicyId, WorkloadEndpointId};
pub(crate) use ids::required;
pub use ipset::IpSet;
pub use rule::Rule;
pub use ruleset::Policy;
pub use workload::WorkloadEndpoint;

use crate::dataplane::{IpSetHandle, PolicyHandle};
use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    pub ingress_policies: Vec<String>,
    pub egress_policies: Vec<String>,
}

impl From<&proto::TierInfo> for Tier {
    fn from(tier: &proto::TierInfo) -> Self {
        Self {
            name: tier.name.clone(),
            ingress_policies: tier.ingress_policies.clone(),
            egress_policies: tier.egress_policies.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolicyState {
    pub ipsets: HashMap<String, IpSet>,
    pub policies: HashMap<PolicyId, Policy>,
    pub profiles: HashMap<String, Policy>,
    pub workload_endpoints: HashMap<WorkloadEndpointId, WorkloadEndpoint>,
    pub host_endpoints: HashMap<HostEndpointId, HostEndpoint>,
}

impl PolicyState {
    pub fn is_empty(&self) -> bool {
        self.ipsets.is_empty()
            && self.policies.is_empty()
            && self.profiles.is_empty()
            && self.workload_endpoints.is_empty()
            && self.host_endpoints.is_empty()
    }

    /// Read access to installed policies and profiles, borrowed separately from
    /// the endpoint maps so endpoints can be configured in place.
    pub fn index(&self) -> PolicyIndex<'_> {
        PolicyIndex {
            policies: &self.policies,
            profiles: &self.profiles,
        }
    }

    /// Splits the generation so endpoints can be configured in place against
    /// the policies of the same generation.
    pub fn split_endpoints(
        &mut self,
    ) -> (
        PolicyIndex<'_>,
        &mut HashMap<WorkloadEndpointId, WorkloadEndpoint>,
        &mut HashMap<HostEndpointId, HostEndpoint>,
    ) {
        (
            PolicyIndex {
                policies: &self.policies,
                profiles: &self.profiles,
            },
            &mut self.workload_endpoints,
            &mut self.host_endpoints,
        )
    }

    pub fn ipset_lookup(
        ipsets: &HashMap<String, IpSet>,
    ) -> impl Fn(&str) -> Option<IpSetHandle> + '_ {
        move |name: &str| ipsets.get(name).and_then(IpSet::handle)
    }
}

#[derive(Clone, Copy)]
pub struct PolicyIndex<'a> {
    pub policies: &'a HashMap<PolicyId, Policy>,
    pub profiles: &'a HashMap<String, Policy>,
}

impl PolicyIndex<'_> {
    pub fn policy(&self, id: &PolicyId) -> Result<PolicyHandle> {
        self.policies
            .get(id)
            .and_then(Policy::handle)
            .ok_or_else(|| Error::Protocol(format!("policy {id} is not installed")))
    }

    pub fn profile(&self, name: &str) -> Result<PolicyHandle> {
        self.profiles
            .get(name)
            .and_then(Policy::handle)
            .ok_or_else(|| Error::Protocol(format!("profile {name} is not installed")))
    }

    /// Ingress and egress policy handles in tier order.
    pub fn tier_policies(
        &self,
        tiers: &[Tier],
    ) -> Result<(Vec<PolicyHandle>, Vec<PolicyHandle>)> {
        let mut ingress = vec![];
        let mut egress = vec![];
        for tier in tiers {
            for name in &tier.ingress_policies {
                ingress.push(self.policy(&PolicyId {
                    tier: tier.name.clone(),
                    name: name.clone(),
                })?);
            }
            for name in &tier.egress_policies {
                egress.push(self.policy(&PolicyId {
                    tier: tier.name.clone(),
                    name: name.clone(),
                })?);
            }
        }
        Ok((ingress, egress))
    }

    pub fn profiles(&self, names: &[String]) -> Result<Vec<PolicyHandle>> {
        names.iter().map(|name| self.profile(name)).collect()
    }
}

/// The configured and pending generations. Callers pick a generation with
/// [`PolicyStore::current`] and promote pending with [`PolicyStore::swap`].
#[derive(Debug, Default)]
pub struct PolicyStore {
    configured: PolicyState,
    pending: PolicyState,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&mut self, pending: bool) -> &mut PolicyState {
        if pending {
            &mut self.pending
        } else {
            &mut self.configured
        }
    }

    pub fn configured(&self) -> &PolicyState {
        &self.configured
    }

    pub fn pending(&self) -> &PolicyState {
        &self.pending
    }

    /// Makes the pending generation the configured one and starts a fresh
    /// pending generation. Returns the previous configured generation.
    pub fn swap(&mut self) -> PolicyState {
        let pending = std::mem::take(&mut self.pending);
        std::mem::replace(&mut self.configured, pending)
    }

    pub fn reset_pending(&mut self) {
        self.pending = PolicyState::default();
    }

    /// Forgets both generations. Used when the dataplane lost its state.
    pub fn clear(&mut self) {
        self.configured = PolicyState::default();
        self.pending = PolicyState::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::IpSetType;

    #[test]
    fn test_swap_promotes_pending() {
        let mut store = PolicyStore::new();
        store
            .current(true)
            .ipsets
            .insert("s1".into(), IpSet::new(IpSetType::Ip));
        store
            .current(false)
            .ipsets
            .insert("old".into(), IpSet::new(IpSetType::Net));

        let previous = store.swap();
        assert!(previous.ipsets.contains_key("old"));
        assert!(store.configured().ipsets.contains_key("s1"));
        assert!(store.pending().is_empty());
    }

    #[test]
    fn test_missing_policy_reference() {
        let state = PolicyState::default();
        let tiers = vec![Tier {
            name: "default".into(),
            ingress_policies: vec!["p1".into()],
            egress_policies: vec![],
        }];
        assert!(state.index().tier_policies(&tiers).is_err());
        assert!(state.index().tier_policies(&[]).unwrap().0.is_empty());
    }
}
