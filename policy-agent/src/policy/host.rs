use std::collections::BTreeSet;
use std::net::IpAddr;

use policy_agent_api::proto;

use super::{PolicyIndex, Tier};
use crate::Result;
use crate::dataplane::{Dataplane, InterfaceConfig, PolicyHandle, SwIfIndex};

/// Node baseline policies host endpoints are built on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostPolicies {
    pub failsafe: Option<PolicyHandle>,
    pub allow_to_host: Option<PolicyHandle>,
    pub allow_from_host: Option<PolicyHandle>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Applied {
    tap: InterfaceConfig,
    forward: InterfaceConfig,
}

/// Host-level policy for the node's uplinks. The uplink, tap and tunnel
/// interfaces are resolved when the update is received.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostEndpoint {
    /// Interface name, `*` for every uplink, or empty to select uplinks by
    /// `expected_ips`.
    pub interface_name: String,
    pub expected_ips: Vec<IpAddr>,
    pub profile_ids: Vec<String>,
    pub tiers: Vec<Tier>,
    pub forward_tiers: Vec<Tier>,
    pub uplinks: Vec<SwIfIndex>,
    pub taps: Vec<SwIfIndex>,
    pub tunnels: BTreeSet<SwIfIndex>,
    applied: Option<Applied>,
}

impl HostEndpoint {
    pub fn from_proto(endpoint: &proto::HostEndpoint) -> Result<Self> {
        let expected_ips = endpoint
            .expected_ipv4_addrs
            .iter()
            .chain(&endpoint.expected_ipv6_addrs)
            .map(|addr| addr.parse::<IpAddr>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            interface_name: endpoint.name.clone(),
            expected_ips,
            profile_ids: endpoint.profile_ids.clone(),
            tiers: endpoint.tiers.iter().map(Tier::from).collect(),
            forward_tiers: endpoint.forward_tiers.iter().map(Tier::from).collect(),
            ..Default::default()
        })
    }

    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }

    /// Configuration of the host facing taps. The failsafe policy comes first
    /// in both directions.
    fn tap_config(&self, index: PolicyIndex<'_>, host: HostPolicies) -> Result<InterfaceConfig> {
        let (mut ingress, mut egress) = index.tier_policies(&self.tiers)?;
        if !ingress.is_empty() {
            prepend(&mut ingress, host.allow_from_host);
        }
        prepend(&mut ingress, host.failsafe);
        prepend(&mut egress, host.failsafe);
        Ok(InterfaceConfig {
            ingress_policies: ingress,
            egress_policies: egress,
            profiles: index.profiles(&self.profile_ids)?,
        })
    }

    /// Configuration of uplinks and tunnels, for traffic forwarded by the node.
    fn forward_config(
        &self,
        index: PolicyIndex<'_>,
        host: HostPolicies,
    ) -> Result<InterfaceConfig> {
        let (ingress, mut egress) = index.tier_policies(&self.forward_tiers)?;
        if !egress.is_empty() {
            prepend(&mut egress, host.allow_to_host);
        }
        Ok(InterfaceConfig {
            ingress_policies: ingress,
            egress_policies: egress,
            profiles: vec![],
        })
    }

    fn interfaces(&self) -> impl Iterator<Item = SwIfIndex> + '_ {
        self.uplinks
            .iter()
            .chain(&self.taps)
            .chain(&self.tunnels)
            .copied()
    }

    fn apply(&self, dp: &dyn Dataplane, applied: &Applied) -> Result<()> {
        for tap in &self.taps {
            dp.configure_policies(*tap, &applied.tap)?;
        }
        for idx in self.uplinks.iter().chain(&self.tunnels) {
            dp.configure_policies(*idx, &applied.forward)?;
        }
        Ok(())
    }

    pub fn create(
        &mut self,
        dp: &dyn Dataplane,
        index: PolicyIndex<'_>,
        host: HostPolicies,
    ) -> Result<()> {
        let applied = Applied {
            tap: self.tap_config(index, host)?,
            forward: self.forward_config(index, host)?,
        };
        self.apply(dp, &applied)?;
        self.applied = Some(applied);
        Ok(())
    }

    /// Applies `new` and resets interfaces it no longer covers.
    pub fn update(
        &mut self,
        dp: &dyn Dataplane,
        new: HostEndpoint,
        index: PolicyIndex<'_>,
        host: HostPolicies,
    ) -> Result<()> {
        let mut new = new;
        new.create(dp, index, host)?;
        let kept: BTreeSet<_> = new.interfaces().collect();
        for idx in self.interfaces().filter(|idx| !kept.contains(idx)) {
            dp.configure_policies(idx, &InterfaceConfig::default())?;
        }
        *self = new;
        Ok(())
    }

    pub fn delete(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if self.applied.take().is_some() {
            for idx in self.interfaces() {
                dp.configure_policies(idx, &InterfaceConfig::default())?;
            }
        }
        Ok(())
    }

    /// Adds a tunnel interface. On an installed endpoint the tunnel receives
    /// the current forward configuration right away.
    pub fn add_tunnel(&mut self, dp: &dyn Dataplane, sw_if_index: SwIfIndex) -> Result<()> {
        if !self.tunnels.insert(sw_if_index) {
            return Ok(());
        }
        if let Some(applied) = &self.applied {
            dp.configure_policies(sw_if_index, &applied.forward)?;
        }
        Ok(())
    }

    /// Forgets a tunnel interface. The dataplane is left untouched, the
    /// interface's own teardown drops its configuration.
    pub fn remove_tunnel(&mut self, sw_if_index: SwIfIndex) {
        self.tunnels.remove(&sw_if_index);
    }
}

fn prepend(policies: &mut Vec<PolicyHandle>, policy: Option<PolicyHandle>) {
    if let Some(policy) = policy {
        policies.insert(0, policy);
    }
}

#[cfg(test)]
mod test {
    use ahash::{HashMap, HashMapExt};

    use super::*;
    use crate::dataplane::{MemoryDataplane, Op};
    use crate::policy::{Policy, PolicyId};

    struct Fixture {
        dp: MemoryDataplane,
        policies: HashMap<PolicyId, Policy>,
        profiles: HashMap<String, Policy>,
        host: HostPolicies,
    }

    impl Fixture {
        fn new() -> Self {
            let dp = MemoryDataplane::new();
            for (idx, tag) in [(1, "main-eth0"), (2, "host-eth0"), (10, "tun0"), (11, "tun1")] {
                dp.add_interface(idx, tag, &[]);
            }
            let create = || Policy::default().create(&dp, &|_| None).unwrap();
            let host = HostPolicies {
                failsafe: Some(create()),
                allow_to_host: Some(create()),
                allow_from_host: Some(create()),
            };
            let mut policies = HashMap::new();
            let mut hep_policy = Policy::default();
            hep_policy.create(&dp, &|_| None).unwrap();
            policies.insert(
                PolicyId {
                    tier: "default".into(),
                    name: "host-ssh".into(),
                },
                hep_policy,
            );
            Self {
                dp,
                policies,
                profiles: HashMap::new(),
                host,
            }
        }

        fn index(&self) -> PolicyIndex<'_> {
            PolicyIndex {
                policies: &self.policies,
                profiles: &self.profiles,
            }
        }

        fn endpoint(&self) -> HostEndpoint {
            let mut hep = HostEndpoint::from_proto(&proto::HostEndpoint {
                name: "eth0".into(),
                tiers: vec![proto::TierInfo {
                    name: "default".into(),
                    ingress_policies: vec!["host-ssh".into()],
                    egress_policies: vec![],
                }],
                ..Default::default()
            })
            .unwrap();
            hep.uplinks = vec![1];
            hep.taps = vec![2];
            hep.tunnels.insert(10);
            hep
        }
    }

    #[test]
    fn test_failsafe_first_on_taps() {
        let f = Fixture::new();
        let mut hep = f.endpoint();
        hep.create(&f.dp, f.index(), f.host).unwrap();

        let tap = f.dp.interface_config(2).unwrap();
        assert_eq!(tap.ingress_policies[0], f.host.failsafe.unwrap());
        assert_eq!(tap.ingress_policies[1], f.host.allow_from_host.unwrap());
        assert_eq!(tap.ingress_policies.len(), 3);
        assert_eq!(tap.egress_policies, vec![f.host.failsafe.unwrap()]);
        // no forward tiers, uplink and tunnel get an empty configuration
        assert_eq!(f.dp.interface_config(1), None);
        assert_eq!(f.dp.count(Op::ConfigurePolicies), 3);

        hep.delete(&f.dp).unwrap();
        assert_eq!(f.dp.interface_config(2), None);
    }

    #[test]
    fn test_tunnel_add_reapplies_but_remove_does_not() {
        let f = Fixture::new();
        let mut hep = f.endpoint();
        hep.forward_tiers = hep.tiers.clone();
        hep.create(&f.dp, f.index(), f.host).unwrap();
        f.dp.clear_calls();

        hep.add_tunnel(&f.dp, 11).unwrap();
        let forward = f.dp.interface_config(11).unwrap();
        assert_eq!(forward, f.dp.interface_config(1).unwrap());
        let calls = f.dp.count(Op::ConfigurePolicies);
        assert_eq!(calls, 1);

        // already present
        hep.add_tunnel(&f.dp, 11).unwrap();
        assert_eq!(f.dp.count(Op::ConfigurePolicies), calls);

        hep.remove_tunnel(11);
        hep.remove_tunnel(11);
        assert_eq!(hep.tunnels.iter().copied().collect::<Vec<_>>(), vec![10]);
        assert_eq!(f.dp.count(Op::ConfigurePolicies), calls);
        assert!(f.dp.interface_config(11).is_some());
    }

    #[test]
    fn test_update_resets_dropped_interfaces() {
        let f = Fixture::new();
        let mut hep = f.endpoint();
        hep.create(&f.dp, f.index(), f.host).unwrap();
        assert!(f.dp.interface_config(2).is_some());

        let mut new = f.endpoint();
        new.taps = vec![];
        new.uplinks = vec![1];
        hep.update(&f.dp, new, f.index(), f.host).unwrap();
        assert_eq!(f.dp.interface_config(2), None);
        assert!(hep.is_applied());
    }

    #[test]
    fn test_pending_tunnel_add_is_local() {
        let f = Fixture::new();
        let mut hep = f.endpoint();
        hep.add_tunnel(&f.dp, 11).unwrap();
        assert!(hep.tunnels.contains(&11));
        assert!(f.dp.calls().iter().all(|c| c.op() != Op::ConfigurePolicies));
    }
}
