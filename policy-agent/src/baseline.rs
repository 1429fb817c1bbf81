//! Node-local policies installed independently of the policy engine.

use ipnetwork::IpNetwork;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::dataplane::{
    Dataplane, InterfaceConfig, IpSetMember, IpSetType, PortRange, RuleAction, RuleSpec,
};
use crate::policy::{HostPolicies, IpSet, Policy, Rule};
use crate::{Error, Result};

const TCP: u8 = 6;
const UDP: u8 = 17;
const WORKLOADS_TO_HOST_IPSET: &str = "workloads-to-host";

/// Destination ports that are always allowed, parsed from a comma separated
/// `protocol:port` list such as `tcp:22,udp:53`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailsafeRules {
    tcp: Vec<PortRange>,
    udp: Vec<PortRange>,
}

impl FailsafeRules {
    pub fn parse(value: &str) -> Result<Self> {
        let value: String = value.split_whitespace().collect();
        let mut rules = Self::default();
        if value.is_empty() {
            return Ok(rules);
        }
        for entry in value.split(',') {
            let Some((protocol, port)) = entry.split_once(':') else {
                return Err(Error::Failsafe(entry.to_string()));
            };
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Failsafe(entry.to_string()))?;
            match protocol.to_ascii_lowercase().as_str() {
                "tcp" => rules.tcp.push(PortRange::single(port)),
                "udp" => rules.udp.push(PortRange::single(port)),
                other => debug!(protocol = other, "ignoring failsafe entry"),
            }
        }
        Ok(rules)
    }

    fn rules(&self) -> Vec<Rule> {
        [("failsafetcp", TCP, &self.tcp), ("failsafeudp", UDP, &self.udp)]
            .into_iter()
            .filter(|(_, _, ports)| !ports.is_empty())
            .map(|(id, protocol, ports)| {
                Rule::new(
                    id,
                    RuleSpec {
                        action: RuleAction::Allow,
                        protocol: Some(protocol),
                        dst_ports: ports.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }
}

struct EndpointToHost {
    ipset: IpSet,
    deny: Policy,
    allow: Policy,
}

impl EndpointToHost {
    fn interface_config(&self) -> InterfaceConfig {
        InterfaceConfig {
            ingress_policies: [self.deny.handle(), self.allow.handle()]
                .into_iter()
                .flatten()
                .collect(),
            ..Default::default()
        }
    }
}

/// Baseline policies live for the lifetime of the dataplane and are never part
/// of a policy generation.
pub struct Baseline {
    failsafe: Policy,
    /// Replaced failsafe policies that host endpoints may still reference.
    retired: Vec<Policy>,
    allow_to_host: Policy,
    allow_from_host: Policy,
    endpoint_to_host: Option<EndpointToHost>,
}

impl Baseline {
    pub fn install(dp: &dyn Dataplane, config: &NodeConfig) -> Result<Self> {
        let failsafe = create_failsafe(dp, config)?;

        info!("creating policy to allow traffic to host");
        let node_nets: Vec<IpNetwork> = config.node_ips.iter().copied().map(IpNetwork::from).collect();
        let mut allow_to_host = Policy::new(
            vec![allow_rule("internal-allow-to-host", |spec| {
                spec.src_net = node_nets.clone()
            })],
            vec![allow_rule("internal-allow-to-host", |spec| {
                spec.dst_net = node_nets.clone()
            })],
        );
        allow_to_host.create(dp, &|_| None)?;

        info!("creating policy to allow traffic from host");
        let mut allow_from_host = Policy::new(
            vec![allow_rule("internal-allow-from-host", |spec| {
                spec.src_net = node_nets.clone()
            })],
            vec![],
        );
        allow_from_host.create(dp, &|_| None)?;

        let endpoint_to_host = if config.drop_endpoint_to_host() {
            Some(create_endpoint_to_host(dp, config)?)
        } else {
            None
        };

        Ok(Self {
            failsafe,
            retired: vec![],
            allow_to_host,
            allow_from_host,
            endpoint_to_host,
        })
    }

    pub fn host_policies(&self) -> HostPolicies {
        HostPolicies {
            failsafe: self.failsafe.handle(),
            allow_to_host: self.allow_to_host.handle(),
            allow_from_host: self.allow_from_host.handle(),
        }
    }

    /// Replaces the failsafe policy with one built from `config`. The old
    /// policy stays installed until [`Baseline::release_retired`], since the
    /// configured host endpoints still apply it.
    pub fn recreate_failsafe(&mut self, dp: &dyn Dataplane, config: &NodeConfig) -> Result<()> {
        let failsafe = create_failsafe(dp, config)?;
        let old = std::mem::replace(&mut self.failsafe, failsafe);
        self.retired.push(old);
        Ok(())
    }

    /// Deletes replaced failsafe policies. Called once the host endpoints have
    /// been rebuilt on the current one. Policies the dataplane refuses to
    /// delete are kept for the next attempt.
    pub fn release_retired(&mut self, dp: &dyn Dataplane) {
        self.retired.retain_mut(|policy| match policy.delete(dp) {
            Ok(()) => false,
            Err(e) => {
                warn!(handle = ?policy.handle(), "cannot delete replaced failsafe policy: {e}");
                true
            }
        });
    }

    /// Adds a workload's addresses to the endpoint-to-host deny set.
    pub fn workload_attached(&mut self, dp: &dyn Dataplane, addresses: &[IpNetwork]) -> Result<()> {
        if let Some(e2h) = self.endpoint_to_host.as_mut() {
            e2h.ipset.add_members(host_members(addresses), Some(dp))?;
        }
        Ok(())
    }

    pub fn workload_detached(&mut self, dp: &dyn Dataplane, addresses: &[IpNetwork]) -> Result<()> {
        if let Some(e2h) = self.endpoint_to_host.as_mut() {
            e2h.ipset.remove_members(host_members(addresses), Some(dp))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn endpoint_to_host_members(&self) -> Vec<String> {
        self.endpoint_to_host
            .as_ref()
            .map(|e2h| e2h.ipset.members().map(|m| m.to_string()).collect())
            .unwrap_or_default()
    }
}

fn allow_rule(id: &str, f: impl FnOnce(&mut RuleSpec<String>)) -> Rule {
    let mut spec = RuleSpec {
        action: RuleAction::Allow,
        ..Default::default()
    };
    f(&mut spec);
    Rule::new(id, spec)
}

fn host_members(addresses: &[IpNetwork]) -> Vec<IpSetMember> {
    addresses
        .iter()
        .map(|net| IpSetMember::Net(IpNetwork::from(net.ip())))
        .collect()
}

fn create_failsafe(dp: &dyn Dataplane, config: &NodeConfig) -> Result<Policy> {
    let inbound = FailsafeRules::parse(&config.failsafe_inbound)?;
    let outbound = FailsafeRules::parse(&config.failsafe_outbound)?;
    info!(
        inbound = %config.failsafe_inbound,
        outbound = %config.failsafe_outbound,
        "creating failsafe policy"
    );
    let mut failsafe = Policy::new(inbound.rules(), outbound.rules());
    failsafe.create(dp, &|_| None)?;
    Ok(failsafe)
}

/// Denies traffic from workloads to the host on every tap, with an allow-all
/// fallback for everything else.
fn create_endpoint_to_host(dp: &dyn Dataplane, config: &NodeConfig) -> Result<EndpointToHost> {
    info!("creating policy to drop traffic from workloads to host");
    let mut ipset = IpSet::new(IpSetType::Ip);
    ipset.create(dp)?;
    let set = ipset.handle();
    let lookup = move |name: &str| (name == WORKLOADS_TO_HOST_IPSET).then_some(set).flatten();

    let mut deny = Policy::new(
        vec![Rule::new(
            "internal-endpoint-to-host-deny",
            RuleSpec {
                action: RuleAction::Deny,
                src_ipsets: vec![WORKLOADS_TO_HOST_IPSET.to_string()],
                ..Default::default()
            },
        )],
        vec![],
    );
    deny.create(dp, &lookup)?;
    let mut allow = Policy::new(
        vec![allow_rule("internal-endpoint-to-host-allow", |_| {})],
        vec![],
    );
    allow.create(dp, &lookup)?;

    let e2h = EndpointToHost { ipset, deny, allow };
    let conf = e2h.interface_config();
    match dp.search_interfaces_with_tag_prefix(&config.tap_tag_prefix) {
        Ok(taps) => {
            for (tag, sw_if_index) in taps {
                if let Err(e) = dp.configure_policies(sw_if_index, &conf) {
                    error!(%tag, sw_if_index, "cannot apply endpoint to host policy: {e}");
                }
            }
        }
        Err(e) => error!("cannot list tap interfaces: {e}"),
    }
    Ok(e2h)
}
