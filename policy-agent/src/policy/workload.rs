use policy_agent_api::proto;

use super::{PolicyIndex, Tier};
use crate::Result;
use crate::dataplane::{Dataplane, InterfaceConfig, SwIfIndex};

/// A pod's policy assignment. It is bound to a dataplane interface only once
/// the workload has attached.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadEndpoint {
    pub name: String,
    pub profile_ids: Vec<String>,
    pub tiers: Vec<Tier>,
    sw_if_index: Option<SwIfIndex>,
}

impl WorkloadEndpoint {
    pub fn from_proto(endpoint: &proto::WorkloadEndpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            profile_ids: endpoint.profile_ids.clone(),
            tiers: endpoint.tiers.iter().map(Tier::from).collect(),
            sw_if_index: None,
        }
    }

    pub fn sw_if_index(&self) -> Option<SwIfIndex> {
        self.sw_if_index
    }

    pub fn interface_config(&self, index: PolicyIndex<'_>) -> Result<InterfaceConfig> {
        let (ingress_policies, egress_policies) = index.tier_policies(&self.tiers)?;
        Ok(InterfaceConfig {
            ingress_policies,
            egress_policies,
            profiles: index.profiles(&self.profile_ids)?,
        })
    }

    pub fn create(
        &mut self,
        dp: &dyn Dataplane,
        sw_if_index: SwIfIndex,
        index: PolicyIndex<'_>,
    ) -> Result<()> {
        let config = self.interface_config(index)?;
        dp.configure_policies(sw_if_index, &config)?;
        self.sw_if_index = Some(sw_if_index);
        Ok(())
    }

    /// Takes the assignment of `new`. It is programmed on the bound
    /// interface, or on `attached` when the endpoint is not bound yet. The
    /// endpoint is left unchanged if the dataplane rejects the configuration.
    pub fn update(
        &mut self,
        dp: &dyn Dataplane,
        new: WorkloadEndpoint,
        attached: Option<SwIfIndex>,
        index: PolicyIndex<'_>,
    ) -> Result<()> {
        let mut new = new;
        if let Some(sw_if_index) = self.sw_if_index.or(attached) {
            new.create(dp, sw_if_index, index)?;
        }
        *self = new;
        Ok(())
    }

    pub fn delete(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if let Some(sw_if_index) = self.sw_if_index.take() {
            dp.configure_policies(sw_if_index, &InterfaceConfig::default())?;
        }
        Ok(())
    }
}
