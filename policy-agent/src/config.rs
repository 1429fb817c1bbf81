use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::Result;
use crate::baseline::FailsafeRules;

const CONFIG_FAILSAFE_INBOUND: &str = "FailsafeInboundHostPorts";
const CONFIG_FAILSAFE_OUTBOUND: &str = "FailsafeOutboundHostPorts";
const CONFIG_ENDPOINT_TO_HOST_ACTION: &str = "EndpointToHostAction";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Unix socket the policy engine connects to
    #[arg(
        long,
        env = "POLICY_SOCKET_PATH",
        default_value = "/var/run/calico/policy-agent.sock"
    )]
    pub socket_path: PathBuf,

    /// Metrics and readiness listener
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Apply policy updates to the dataplane. When false, entity updates are dropped.
    #[arg(long, env = "ENABLE_POLICIES", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_policies: bool,

    /// Comma separated protocol:port list always allowed inbound
    #[arg(
        long,
        env = "FAILSAFE_INBOUND_HOST_PORTS",
        default_value = "tcp:22,udp:68,tcp:179,tcp:2379,tcp:2380,tcp:5473,tcp:6443,tcp:6666,tcp:6667"
    )]
    pub failsafe_inbound_host_ports: String,

    /// Comma separated protocol:port list always allowed outbound
    #[arg(
        long,
        env = "FAILSAFE_OUTBOUND_HOST_PORTS",
        default_value = "udp:53,udp:67,tcp:179,tcp:2379,tcp:2380,tcp:5473,tcp:6443,tcp:6666,tcp:6667"
    )]
    pub failsafe_outbound_host_ports: String,

    /// What to do with traffic from workloads to the host
    #[arg(
        long,
        env = "ENDPOINT_TO_HOST_ACTION",
        value_enum,
        ignore_case = true,
        default_value_t = EndpointToHostAction::Accept
    )]
    pub endpoint_to_host_action: EndpointToHostAction,

    /// IPv4 address of this node
    #[arg(long, env = "NODE_IPV4")]
    pub node_ipv4: Option<Ipv4Addr>,

    /// IPv6 address of this node
    #[arg(long, env = "NODE_IPV6")]
    pub node_ipv6: Option<Ipv6Addr>,

    /// Tag prefix of the dataplane uplink interfaces
    #[arg(long, default_value = "main-")]
    pub uplink_tag_prefix: String,

    /// Tag prefix of the host side tap interfaces
    #[arg(long, default_value = "host-")]
    pub tap_tag_prefix: String,

    /// Seconds to wait for the connection reader to stop
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EndpointToHostAction {
    #[default]
    Accept,
    Drop,
}

impl EndpointToHostAction {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DROP" => Some(Self::Drop),
            "ACCEPT" | "RETURN" => Some(Self::Accept),
            _ => None,
        }
    }
}

/// Node level settings shared by the server and the baseline policies.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub socket_path: PathBuf,
    pub enable_policies: bool,
    pub failsafe_inbound: String,
    pub failsafe_outbound: String,
    pub endpoint_to_host_action: EndpointToHostAction,
    pub node_ips: Vec<IpAddr>,
    pub uplink_tag_prefix: String,
    pub tap_tag_prefix: String,
    pub shutdown_timeout: Duration,
}

impl NodeConfig {
    /// Validates the startup configuration. Malformed failsafe lists are
    /// rejected here so the agent never starts without failsafe rules.
    pub fn try_from_args(args: &AgentArgs) -> Result<Self> {
        FailsafeRules::parse(&args.failsafe_inbound_host_ports)?;
        FailsafeRules::parse(&args.failsafe_outbound_host_ports)?;

        let mut node_ips = vec![];
        if let Some(ip4) = args.node_ipv4 {
            node_ips.push(IpAddr::V4(ip4));
        }
        if let Some(ip6) = args.node_ipv6 {
            node_ips.push(IpAddr::V6(ip6));
        }
        Ok(Self {
            socket_path: args.socket_path.clone(),
            enable_policies: args.enable_policies,
            failsafe_inbound: args.failsafe_inbound_host_ports.clone(),
            failsafe_outbound: args.failsafe_outbound_host_ports.clone(),
            endpoint_to_host_action: args.endpoint_to_host_action,
            node_ips,
            uplink_tag_prefix: args.uplink_tag_prefix.clone(),
            tap_tag_prefix: args.tap_tag_prefix.clone(),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }

    pub fn drop_endpoint_to_host(&self) -> bool {
        self.endpoint_to_host_action == EndpointToHostAction::Drop
    }

    /// Applies the keys of a ConfigUpdate that the agent understands. Unknown
    /// keys are ignored, the policy engine sends its whole configuration.
    pub fn apply_engine_config(&mut self, config: &HashMap<String, String>) {
        if let Some(inbound) = config.get(CONFIG_FAILSAFE_INBOUND) {
            self.failsafe_inbound = inbound.clone();
        }
        if let Some(outbound) = config.get(CONFIG_FAILSAFE_OUTBOUND) {
            self.failsafe_outbound = outbound.clone();
        }
        if let Some(action) = config
            .get(CONFIG_ENDPOINT_TO_HOST_ACTION)
            .and_then(|a| EndpointToHostAction::parse(a))
        {
            self.endpoint_to_host_action = action;
        }
    }
}

#[cfg(test)]
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/policy-agent.sock"),
            enable_policies: true,
            failsafe_inbound: "tcp:22".into(),
            failsafe_outbound: "udp:53".into(),
            endpoint_to_host_action: EndpointToHostAction::Accept,
            node_ips: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))],
            uplink_tag_prefix: "main-".into(),
            tap_tag_prefix: "host-".into(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}
