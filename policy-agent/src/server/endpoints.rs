use std::sync::{Arc, Mutex};

use ipnetwork::IpNetwork;
use tracing::{debug, error, info, warn};

use super::state::{AgentState, lock};
use crate::dataplane::{Dataplane, SwIfIndex};
use crate::policy::WorkloadEndpointId;
use crate::{Result, ResultExt};

/// Entry point for the pod interface driver. Attach and detach run on the
/// caller's task and share the control loop's lock.
#[derive(Clone)]
pub struct EndpointHandle {
    state: Arc<Mutex<AgentState>>,
    dp: Arc<dyn Dataplane>,
}

impl EndpointHandle {
    pub(crate) fn new(state: Arc<Mutex<AgentState>>, dp: Arc<dyn Dataplane>) -> Self {
        Self { state, dp }
    }

    /// Records the interface of a workload and programs its endpoint if the
    /// policy engine already sent it.
    pub fn attach(
        &self,
        id: &WorkloadEndpointId,
        sw_if_index: SwIfIndex,
        addresses: &[IpNetwork],
    ) -> Result<()> {
        let dp = self.dp.as_ref();
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        // A known workload only has its interface recorded again.
        match state.endpoints.insert(id.clone(), sw_if_index) {
            Some(previous) if previous != sw_if_index => {
                warn!(%id, previous, sw_if_index, "workload re-attached on a new interface");
                return Ok(());
            }
            Some(_) => {
                debug!(%id, sw_if_index, "workload already attached");
                return Ok(());
            }
            None if state.in_sync() => {
                let (index, weps, _) = state.store.current(false).split_endpoints();
                if let Some(wep) = weps.get_mut(id) {
                    wep.create(dp, sw_if_index, index)
                        .context(|| format!("cannot create workload endpoint {id}"))?;
                    info!(%id, sw_if_index, "workload endpoint created");
                }
            }
            None => debug!(%id, sw_if_index, state = %state.sync, "workload attached"),
        }
        state.baseline.workload_attached(dp, addresses)
    }

    /// Forgets the interface of a workload, resetting its policies first.
    pub fn detach(&self, id: &WorkloadEndpointId, addresses: &[IpNetwork]) -> Result<()> {
        let dp = self.dp.as_ref();
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        if state.endpoints.remove(id).is_none() {
            error!(%id, "detach for unknown workload");
            return Ok(());
        }
        let in_sync = state.in_sync();
        let deleted = match state.store.current(false).workload_endpoints.get_mut(id) {
            Some(wep) if in_sync => wep
                .delete(dp)
                .context(|| format!("cannot delete workload endpoint {id}")),
            _ => Ok(()),
        };
        state.baseline.workload_detached(dp, addresses)?;
        deleted
    }

    /// Interfaces of attached workloads.
    pub fn attached(&self) -> Vec<(WorkloadEndpointId, SwIfIndex)> {
        let state = lock(&self.state);
        let mut attached: Vec<_> = state
            .endpoints
            .iter()
            .map(|(id, idx)| (id.clone(), *idx))
            .collect();
        attached.sort();
        attached
    }
}

#[cfg(test)]
mod test {
    use policy_agent_api::{Message, proto};

    use super::*;
    use crate::config::{EndpointToHostAction, NodeConfig};
    use crate::dataplane::{MemoryDataplane, Op};
    use crate::server::SyncState;

    fn handle(dp: &MemoryDataplane, config: Option<NodeConfig>) -> EndpointHandle {
        let mut state = AgentState::for_test(dp);
        if let Some(config) = config {
            state.baseline = crate::baseline::Baseline::install(dp, &config).unwrap();
            state.config = config;
        }
        EndpointHandle::new(Arc::new(Mutex::new(state)), Arc::new(dp.clone()))
    }

    fn id() -> WorkloadEndpointId {
        WorkloadEndpointId::new("k8s", "default/pod-1", "eth0")
    }

    fn wep_update() -> Message {
        Message::WorkloadEndpointUpdate(proto::WorkloadEndpointUpdate {
            id: Some(proto::WorkloadEndpointId {
                orchestrator_id: "k8s".into(),
                workload_id: "default/pod-1".into(),
                endpoint_id: "eth0".into(),
            }),
            endpoint: Some(proto::WorkloadEndpoint {
                name: "cali0".into(),
                ..Default::default()
            }),
        })
    }

    fn in_sync(handle: &EndpointHandle, dp: &MemoryDataplane) {
        let mut state = lock(&handle.state);
        state.sync = SyncState::Connected;
        let config = Message::ConfigUpdate(proto::ConfigUpdate::default());
        state.dispatch(dp, config).unwrap();
        state.dispatch(dp, Message::InSync(proto::InSync {})).unwrap();
    }

    #[test]
    fn test_attach_detach_restores_registry() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let handle = handle(&dp, None);
        let before = handle.attached();

        handle.attach(&id(), 7, &[]).unwrap();
        assert_eq!(handle.attached(), vec![(id(), 7)]);
        handle.detach(&id(), &[]).unwrap();
        assert_eq!(handle.attached(), before);
    }

    #[test]
    fn test_update_before_attach() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let handle = handle(&dp, None);
        in_sync(&handle, &dp);
        dp.clear_calls();

        lock(&handle.state).dispatch(&dp, wep_update()).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 0);

        handle.attach(&id(), 7, &[]).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 1);
    }

    #[test]
    fn test_update_after_attach() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let handle = handle(&dp, None);
        in_sync(&handle, &dp);
        dp.clear_calls();

        handle.attach(&id(), 7, &[]).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 0);
        lock(&handle.state).dispatch(&dp, wep_update()).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 1);
    }

    #[test]
    fn test_double_detach_is_noop() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let handle = handle(&dp, None);
        in_sync(&handle, &dp);
        lock(&handle.state).dispatch(&dp, wep_update()).unwrap();
        handle.attach(&id(), 7, &[]).unwrap();
        dp.clear_calls();

        handle.detach(&id(), &[]).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 1);
        handle.detach(&id(), &[]).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 1);
        assert!(handle.attached().is_empty());
    }

    #[test]
    fn test_rehomed_interface_is_not_reconfigured() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        dp.add_interface(8, "tap8", &[]);
        let handle = handle(&dp, None);
        in_sync(&handle, &dp);
        lock(&handle.state).dispatch(&dp, wep_update()).unwrap();
        handle.attach(&id(), 7, &[]).unwrap();
        dp.clear_calls();

        handle.attach(&id(), 8, &[]).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 0);
        assert_eq!(handle.attached(), vec![(id(), 8)]);
    }

    #[test]
    fn test_repeated_attach_is_noop() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let config = NodeConfig {
            endpoint_to_host_action: EndpointToHostAction::Drop,
            ..Default::default()
        };
        let handle = handle(&dp, Some(config));
        in_sync(&handle, &dp);
        lock(&handle.state).dispatch(&dp, wep_update()).unwrap();
        let addresses: Vec<IpNetwork> = vec!["10.1.0.4/24".parse().unwrap()];
        handle.attach(&id(), 7, &addresses).unwrap();
        dp.clear_calls();

        handle.attach(&id(), 7, &addresses).unwrap();
        assert_eq!(dp.count(Op::ConfigurePolicies), 0);
        assert_eq!(dp.count(Op::IpSetAddMembers), 0);
        assert_eq!(handle.attached(), vec![(id(), 7)]);
        assert_eq!(
            lock(&handle.state).baseline.endpoint_to_host_members(),
            vec!["10.1.0.4/32"]
        );
    }

    #[test]
    fn test_endpoint_to_host_members_follow_workloads() {
        let dp = MemoryDataplane::new();
        dp.add_interface(7, "tap7", &[]);
        let config = NodeConfig {
            endpoint_to_host_action: EndpointToHostAction::Drop,
            ..Default::default()
        };
        let handle = handle(&dp, Some(config));
        let addresses: Vec<IpNetwork> = vec!["10.1.0.4/24".parse().unwrap()];

        handle.attach(&id(), 7, &addresses).unwrap();
        assert_eq!(
            lock(&handle.state).baseline.endpoint_to_host_members(),
            vec!["10.1.0.4/32"]
        );
        handle.detach(&id(), &addresses).unwrap();
        assert!(lock(&handle.state).baseline.endpoint_to_host_members().is_empty());
    }
}
