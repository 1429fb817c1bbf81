use std::fmt::Display;

use policy_agent_api::proto;

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadEndpointId {
    pub orchestrator_id: String,
    pub workload_id: String,
    pub endpoint_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostEndpointId {
    pub endpoint_id: String,
}

impl WorkloadEndpointId {
    pub fn new(orchestrator_id: &str, workload_id: &str, endpoint_id: &str) -> Self {
        Self {
            orchestrator_id: orchestrator_id.to_string(),
            workload_id: workload_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
        }
    }
}

impl Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tier, self.name)
    }
}

impl Display for WorkloadEndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

impl Display for HostEndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint_id)
    }
}

impl From<&proto::PolicyId> for PolicyId {
    fn from(id: &proto::PolicyId) -> Self {
        Self {
            tier: id.tier.clone(),
            name: id.name.clone(),
        }
    }
}

impl From<&proto::WorkloadEndpointId> for WorkloadEndpointId {
    fn from(id: &proto::WorkloadEndpointId) -> Self {
        Self {
            orchestrator_id: id.orchestrator_id.clone(),
            workload_id: id.workload_id.clone(),
            endpoint_id: id.endpoint_id.clone(),
        }
    }
}

impl From<&proto::HostEndpointId> for HostEndpointId {
    fn from(id: &proto::HostEndpointId) -> Self {
        Self {
            endpoint_id: id.endpoint_id.clone(),
        }
    }
}

/// Unwraps an optional message field, a missing one is a protocol error.
pub(crate) fn required<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| Error::Protocol(format!("message is missing {name}")))
}
