//! Entity handlers. With `pending` set an update only touches the pending
//! generation; otherwise the dataplane is programmed as the configured
//! generation changes.

use policy_agent_api::proto;
use tracing::{debug, info};

use super::AgentState;
use crate::dataplane::Dataplane;
use crate::policy::{
    HostEndpoint, HostEndpointId, IpSet, Policy, PolicyId, PolicyState, WorkloadEndpoint,
    WorkloadEndpointId, required,
};
use crate::{Error, Result, ResultExt};

impl AgentState {
    pub(super) fn handle_ipset_update(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::IpSetUpdate,
        pending: bool,
    ) -> Result<()> {
        let state = self.store.current(pending);
        if state.ipsets.contains_key(&msg.id) {
            return Err(Error::Protocol(format!("ipset {} already exists", msg.id)));
        }
        let mut ipset = IpSet::from_proto(&msg)?;
        if !pending {
            ipset
                .create(dp)
                .context(|| format!("cannot create ipset {}", msg.id))?;
        }
        debug!(id = %msg.id, pending, "ipset added");
        state.ipsets.insert(msg.id, ipset);
        Ok(())
    }

    pub(super) fn handle_ipset_delta(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::IpSetDeltaUpdate,
        pending: bool,
    ) -> Result<()> {
        let state = self.store.current(pending);
        let Some(ipset) = state.ipsets.get_mut(&msg.id) else {
            return Err(Error::Protocol(format!(
                "received delta update for unknown ipset {}",
                msg.id
            )));
        };
        let added = ipset.parse_members(&msg.added_members)?;
        let removed = ipset.parse_members(&msg.removed_members)?;
        ipset
            .apply_delta(added, removed, (!pending).then_some(dp))
            .context(|| format!("cannot update ipset {}", msg.id))
    }

    pub(super) fn handle_ipset_remove(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::IpSetRemove,
        pending: bool,
    ) -> Result<()> {
        let state = self.store.current(pending);
        let Some(mut ipset) = state.ipsets.remove(&msg.id) else {
            debug!(id = %msg.id, "received remove for unknown ipset");
            return Ok(());
        };
        if !pending {
            ipset
                .delete(dp)
                .context(|| format!("cannot delete ipset {}", msg.id))?;
        }
        Ok(())
    }

    pub(super) fn handle_policy_update(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::ActivePolicyUpdate,
        pending: bool,
    ) -> Result<()> {
        let id = PolicyId::from(required(&msg.id, "policy id")?);
        let mut policy = Policy::from_proto_policy(required(&msg.policy, "policy")?)?;
        let state = self.store.current(pending);
        if pending {
            state.policies.insert(id, policy);
            return Ok(());
        }
        let lookup = PolicyState::ipset_lookup(&state.ipsets);
        match state.policies.get_mut(&id) {
            Some(existing) => existing
                .update(dp, policy, &lookup)
                .context(|| format!("cannot update policy {id}"))?,
            None => {
                policy
                    .create(dp, &lookup)
                    .context(|| format!("cannot create policy {id}"))?;
                info!(%id, "policy created");
                state.policies.insert(id, policy);
            }
        }
        Ok(())
    }

    pub(super) fn handle_policy_remove(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::ActivePolicyRemove,
        pending: bool,
    ) -> Result<()> {
        let id = PolicyId::from(required(&msg.id, "policy id")?);
        let state = self.store.current(pending);
        let Some(mut policy) = state.policies.remove(&id) else {
            debug!(%id, "received remove for unknown policy");
            return Ok(());
        };
        if !pending {
            policy
                .delete(dp)
                .context(|| format!("cannot delete policy {id}"))?;
            info!(%id, "policy deleted");
        }
        Ok(())
    }

    pub(super) fn handle_profile_update(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::ActiveProfileUpdate,
        pending: bool,
    ) -> Result<()> {
        let name = required(&msg.id, "profile id")?.name.clone();
        let mut profile = Policy::from_proto_profile(required(&msg.profile, "profile")?)?;
        let state = self.store.current(pending);
        if pending {
            state.profiles.insert(name, profile);
            return Ok(());
        }
        let lookup = PolicyState::ipset_lookup(&state.ipsets);
        match state.profiles.get_mut(&name) {
            Some(existing) => existing
                .update(dp, profile, &lookup)
                .context(|| format!("cannot update profile {name}"))?,
            None => {
                profile
                    .create(dp, &lookup)
                    .context(|| format!("cannot create profile {name}"))?;
                info!(%name, "profile created");
                state.profiles.insert(name, profile);
            }
        }
        Ok(())
    }

    pub(super) fn handle_profile_remove(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::ActiveProfileRemove,
        pending: bool,
    ) -> Result<()> {
        let name = &required(&msg.id, "profile id")?.name;
        let state = self.store.current(pending);
        let Some(mut profile) = state.profiles.remove(name) else {
            debug!(%name, "received remove for unknown profile");
            return Ok(());
        };
        if !pending {
            profile
                .delete(dp)
                .context(|| format!("cannot delete profile {name}"))?;
            info!(%name, "profile deleted");
        }
        Ok(())
    }

    pub(super) fn handle_host_endpoint_update(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::HostEndpointUpdate,
        pending: bool,
    ) -> Result<()> {
        let id = HostEndpointId::from(required(&msg.id, "host endpoint id")?);
        let mut hep = HostEndpoint::from_proto(required(&msg.endpoint, "host endpoint")?)?;
        self.resolve_host_endpoint(dp, &id, &mut hep)?;
        let host = self.baseline.host_policies();

        let state = self.store.current(pending);
        if pending {
            state.host_endpoints.insert(id, hep);
            return Ok(());
        }
        let (index, _, heps) = state.split_endpoints();
        match heps.get_mut(&id) {
            Some(existing) => existing
                .update(dp, hep, index, host)
                .context(|| format!("cannot update host endpoint {id}"))?,
            None => {
                hep.create(dp, index, host)
                    .context(|| format!("cannot create host endpoint {id}"))?;
                info!(%id, uplinks = ?hep.uplinks, "host endpoint created");
                heps.insert(id, hep);
            }
        }
        Ok(())
    }

    pub(super) fn handle_host_endpoint_remove(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::HostEndpointRemove,
        pending: bool,
    ) -> Result<()> {
        let id = HostEndpointId::from(required(&msg.id, "host endpoint id")?);
        let state = self.store.current(pending);
        let Some(mut hep) = state.host_endpoints.remove(&id) else {
            debug!(%id, "received remove for unknown host endpoint");
            return Ok(());
        };
        if !pending {
            hep.delete(dp)
                .context(|| format!("cannot delete host endpoint {id}"))?;
            info!(%id, "host endpoint deleted");
        }
        Ok(())
    }

    /// The endpoint is programmed only once its workload has attached an
    /// interface.
    pub(super) fn handle_workload_endpoint_update(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::WorkloadEndpointUpdate,
        pending: bool,
    ) -> Result<()> {
        let id = WorkloadEndpointId::from(required(&msg.id, "workload endpoint id")?);
        let wep = WorkloadEndpoint::from_proto(required(&msg.endpoint, "workload endpoint")?);
        let sw_if_index = self.endpoints.get(&id).copied();

        let state = self.store.current(pending);
        if pending {
            state.workload_endpoints.insert(id, wep);
            return Ok(());
        }
        let (index, weps, _) = state.split_endpoints();
        match weps.get_mut(&id) {
            Some(existing) => existing
                .update(dp, wep, sw_if_index, index)
                .context(|| format!("cannot update workload endpoint {id}"))?,
            None => {
                let mut wep = wep;
                if let Some(sw_if_index) = sw_if_index {
                    wep.create(dp, sw_if_index, index)
                        .context(|| format!("cannot create workload endpoint {id}"))?;
                    info!(%id, sw_if_index, "workload endpoint created");
                }
                weps.insert(id, wep);
            }
        }
        Ok(())
    }

    pub(super) fn handle_workload_endpoint_remove(
        &mut self,
        dp: &dyn Dataplane,
        msg: proto::WorkloadEndpointRemove,
        pending: bool,
    ) -> Result<()> {
        let id = WorkloadEndpointId::from(required(&msg.id, "workload endpoint id")?);
        let state = self.store.current(pending);
        let Some(mut wep) = state.workload_endpoints.remove(&id) else {
            debug!(%id, "received remove for unknown workload endpoint");
            return Ok(());
        };
        if !pending {
            wep.delete(dp)
                .context(|| format!("cannot delete workload endpoint {id}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::{MemoryDataplane, Op};
    use crate::server::SyncState;

    fn ipset_update(id: &str, members: &[&str]) -> proto::IpSetUpdate {
        proto::IpSetUpdate {
            id: id.into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            r#type: proto::IpSetType::Net as i32,
        }
    }

    fn wep_update(id: &WorkloadEndpointId) -> proto::WorkloadEndpointUpdate {
        proto::WorkloadEndpointUpdate {
            id: Some(proto::WorkloadEndpointId {
                orchestrator_id: id.orchestrator_id.clone(),
                workload_id: id.workload_id.clone(),
                endpoint_id: id.endpoint_id.clone(),
            }),
            endpoint: Some(proto::WorkloadEndpoint {
                name: "cali0".into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_ipset_update_then_delta() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);
        state.sync = SyncState::InSync;

        state
            .handle_ipset_update(&dp, ipset_update("s1", &["10.0.0.0/24", "10.0.1.0/24"]), false)
            .unwrap();
        state
            .handle_ipset_delta(
                &dp,
                proto::IpSetDeltaUpdate {
                    id: "s1".into(),
                    added_members: vec!["10.0.2.0/24".into(), "10.0.1.0/24".into()],
                    removed_members: vec!["10.0.0.0/24".into(), "10.0.1.0/24".into()],
                },
                false,
            )
            .unwrap();
        let ipset = &state.store.configured().ipsets["s1"];
        let members: Vec<_> = ipset.members().map(|m| m.to_string()).collect();
        assert_eq!(members, vec!["10.0.2.0/24"]);
        let mut in_dataplane: Vec<_> = dp
            .ipset_members(ipset.handle().unwrap())
            .unwrap()
            .iter()
            .map(|m| m.to_string())
            .collect();
        in_dataplane.sort();
        assert_eq!(in_dataplane, members);
    }

    #[test]
    fn test_ipset_protocol_errors() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);

        state
            .handle_ipset_update(&dp, ipset_update("s1", &[]), true)
            .unwrap();
        assert!(matches!(
            state.handle_ipset_update(&dp, ipset_update("s1", &[]), true),
            Err(Error::Protocol(_))
        ));
        let delta = proto::IpSetDeltaUpdate {
            id: "s2".into(),
            added_members: vec!["10.0.0.1".into()],
            removed_members: vec![],
        };
        assert!(matches!(
            state.handle_ipset_delta(&dp, delta, true),
            Err(Error::Protocol(_))
        ));
        // pending updates never reach the dataplane
        assert_eq!(dp.count(Op::IpSetCreate), 0);
    }

    #[test]
    fn test_redundant_removes_are_tolerated() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);
        dp.clear_calls();

        for pending in [true, false] {
            state
                .handle_ipset_remove(&dp, proto::IpSetRemove { id: "gone".into() }, pending)
                .unwrap();
            state
                .handle_policy_remove(
                    &dp,
                    proto::ActivePolicyRemove {
                        id: Some(proto::PolicyId {
                            tier: "default".into(),
                            name: "gone".into(),
                        }),
                    },
                    pending,
                )
                .unwrap();
            state
                .handle_profile_remove(
                    &dp,
                    proto::ActiveProfileRemove {
                        id: Some(proto::ProfileId {
                            name: "gone".into(),
                        }),
                    },
                    pending,
                )
                .unwrap();
        }
        assert!(dp.calls().is_empty());
    }

    #[test]
    fn test_live_policy_lifecycle() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);
        let (_, rules_before, policies_before) = dp.object_counts();

        state
            .handle_ipset_update(&dp, ipset_update("s1", &["10.0.0.0/24"]), false)
            .unwrap();
        let update = proto::ActivePolicyUpdate {
            id: Some(proto::PolicyId {
                tier: "default".into(),
                name: "p1".into(),
            }),
            policy: Some(proto::Policy {
                inbound_rules: vec![proto::Rule {
                    action: "allow".into(),
                    src_ip_set_ids: vec!["s1".into()],
                    rule_id: "r1".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        state.handle_policy_update(&dp, update.clone(), false).unwrap();
        state.handle_policy_update(&dp, update, false).unwrap();
        assert_eq!(dp.count(Op::PolicyCreate), 4);
        assert_eq!(dp.count(Op::PolicyUpdate), 1);

        // a rule referencing an unknown ipset is rejected
        let bad = proto::ActivePolicyUpdate {
            id: Some(proto::PolicyId {
                tier: "default".into(),
                name: "p2".into(),
            }),
            policy: Some(proto::Policy {
                outbound_rules: vec![proto::Rule {
                    dst_ip_set_ids: vec!["missing".into()],
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        assert!(state.handle_policy_update(&dp, bad, false).is_err());

        state
            .handle_policy_remove(
                &dp,
                proto::ActivePolicyRemove {
                    id: Some(proto::PolicyId {
                        tier: "default".into(),
                        name: "p1".into(),
                    }),
                },
                false,
            )
            .unwrap();
        state
            .handle_ipset_remove(&dp, proto::IpSetRemove { id: "s1".into() }, false)
            .unwrap();
        assert_eq!(dp.object_counts(), (0, rules_before, policies_before));
    }

    fn policy_update(name: &str, ipset: &str) -> proto::ActivePolicyUpdate {
        proto::ActivePolicyUpdate {
            id: Some(proto::PolicyId {
                tier: "default".into(),
                name: name.into(),
            }),
            policy: Some(proto::Policy {
                inbound_rules: vec![proto::Rule {
                    action: "allow".into(),
                    src_ip_set_ids: vec![ipset.into()],
                    rule_id: "r1".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_failed_policy_update_is_released_by_resync() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);
        state.sync = SyncState::InSync;
        let before = dp.object_counts();

        state
            .handle_ipset_update(&dp, ipset_update("s1", &["10.0.0.0/24"]), false)
            .unwrap();
        state
            .handle_policy_update(&dp, policy_update("p1", "s1"), false)
            .unwrap();
        let mut changed = policy_update("p1", "missing");
        if let Some(policy) = changed.policy.as_mut() {
            policy.inbound_rules[0].rule_id = "r2".into();
        }
        assert!(state.handle_policy_update(&dp, changed, false).is_err());

        // the engine resyncs with nothing configured
        state.apply_pending_state(&dp).unwrap();
        assert_eq!(dp.object_counts(), before);
    }

    #[test]
    fn test_rejected_workload_update_is_not_stored() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let mut state = AgentState::for_test(&dp);
        state.sync = SyncState::InSync;
        let id = WorkloadEndpointId::new("k8s", "default/pod-1", "eth0");
        state.endpoints.insert(id.clone(), 7);

        let mut msg = wep_update(&id);
        if let Some(endpoint) = msg.endpoint.as_mut() {
            endpoint.profile_ids = vec!["not-installed".into()];
        }
        assert!(
            state
                .handle_workload_endpoint_update(&dp, msg, false)
                .is_err()
        );
        assert!(state.store.configured().workload_endpoints.is_empty());
        assert_eq!(dp.interface_config(7), None);
    }

    #[test]
    fn test_workload_update_waits_for_interface() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let mut state = AgentState::for_test(&dp);
        let id = WorkloadEndpointId::new("k8s", "default/pod-1", "eth0");

        state
            .handle_workload_endpoint_update(&dp, wep_update(&id), false)
            .unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 0);

        state.endpoints.insert(id.clone(), 7);
        state
            .handle_workload_endpoint_update(&dp, wep_update(&id), false)
            .unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 1);
        assert_eq!(
            state.store.configured().workload_endpoints[&id].sw_if_index(),
            Some(7)
        );

        let remove = proto::WorkloadEndpointRemove {
            id: wep_update(&id).id,
        };
        state
            .handle_workload_endpoint_remove(&dp, remove.clone(), false)
            .unwrap();
        state
            .handle_workload_endpoint_remove(&dp, remove, false)
            .unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 2);
    }

    #[test]
    fn test_missing_fields_are_protocol_errors() {
        let dp = MemoryDataplane::new();
        let mut state = AgentState::for_test(&dp);
        let msg = proto::WorkloadEndpointUpdate {
            id: None,
            endpoint: None,
        };
        assert!(matches!(
            state.handle_workload_endpoint_update(&dp, msg, true),
            Err(Error::Protocol(_))
        ));
    }
}
