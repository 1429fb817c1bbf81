mod memory;

use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use thiserror::Error;

pub use memory::{Call, MemoryDataplane, Op};

pub type SwIfIndex = u32;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u32 },

    #[error("{kind} {id} is still referenced")]
    InUse { kind: &'static str, id: u32 },

    #[error("interface {0} does not exist")]
    NoSuchInterface(SwIfIndex),

    #[error("invalid ipset member {member}: {reason}")]
    InvalidMember { member: String, reason: String },

    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    #[error("{0} failed")]
    Injected(Op),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! handle {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle!(IpSetHandle);
handle!(RuleHandle);
handle!(PolicyHandle);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IpSetType {
    #[default]
    Ip,
    IpPort,
    Net,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpSetMember {
    Net(IpNetwork),
    IpPort { ip: IpAddr, protocol: u8, port: u16 },
}

impl IpSetMember {
    /// Parses a member the way the policy engine encodes it for the given set
    /// type: `addr` or `cidr` for address sets, `addr,proto:port` for ip+port
    /// sets.
    pub fn parse(kind: IpSetType, member: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidMember {
            member: member.to_string(),
            reason: reason.to_string(),
        };
        match kind {
            IpSetType::Ip | IpSetType::Net => parse_net(member)
                .map(IpSetMember::Net)
                .ok_or_else(|| invalid("not an address or network")),
            IpSetType::IpPort => {
                let (ip, proto_port) = member
                    .split_once(',')
                    .ok_or_else(|| invalid("expected addr,proto:port"))?;
                let (protocol, port) = proto_port
                    .split_once(':')
                    .ok_or_else(|| invalid("expected proto:port"))?;
                let ip = IpAddr::from_str(ip.trim()).map_err(|e| invalid(&e.to_string()))?;
                let protocol = parse_protocol_name(protocol.trim())?;
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|e| invalid(&e.to_string()))?;
                Ok(IpSetMember::IpPort { ip, protocol, port })
            }
        }
    }
}

impl Display for IpSetMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpSetMember::Net(net) => write!(f, "{net}"),
            IpSetMember::IpPort { ip, protocol, port } => write!(f, "{ip},{protocol}:{port}"),
        }
    }
}

/// Parses `addr` as a full length prefix, or `addr/len`.
pub fn parse_net(value: &str) -> Option<IpNetwork> {
    let value = value.trim();
    if let Ok(net) = IpNetwork::from_str(value) {
        return Some(net);
    }
    IpAddr::from_str(value).ok().map(IpNetwork::from)
}

pub fn parse_protocol_name(name: &str) -> Result<u8> {
    let proto = match name.to_ascii_lowercase().as_str() {
        "icmp" => 1,
        "tcp" => 6,
        "udp" => 17,
        "icmpv6" => 58,
        "sctp" => 132,
        "udplite" => 136,
        other => return other
            .parse::<u8>()
            .map_err(|_| Error::UnknownProtocol(name.to_string())),
    };
    Ok(proto)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
    Log,
    Pass,
}

impl FromStr for RuleAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "log" => Ok(Self::Log),
            "pass" | "next-tier" => Ok(Self::Pass),
            other => Err(Error::InvalidMember {
                member: other.to_string(),
                reason: "unknown rule action".to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            first: port,
            last: port,
        }
    }
}

/// One match/action clause. `S` is how IP sets are referenced: by name in the
/// policy model, by dataplane handle once resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuleSpec<S = IpSetHandle> {
    pub action: RuleAction,
    pub protocol: Option<u8>,
    pub not_protocol: Option<u8>,
    pub src_net: Vec<IpNetwork>,
    pub not_src_net: Vec<IpNetwork>,
    pub dst_net: Vec<IpNetwork>,
    pub not_dst_net: Vec<IpNetwork>,
    pub src_ports: Vec<PortRange>,
    pub not_src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub not_dst_ports: Vec<PortRange>,
    pub src_ipsets: Vec<S>,
    pub not_src_ipsets: Vec<S>,
    pub dst_ipsets: Vec<S>,
    pub not_dst_ipsets: Vec<S>,
    pub dst_ip_port_sets: Vec<S>,
}

impl<S> RuleSpec<S> {
    /// Maps every IP set reference, failing on the first one `f` rejects.
    pub fn try_map_ipsets<T, E>(
        &self,
        mut f: impl FnMut(&S) -> std::result::Result<T, E>,
    ) -> std::result::Result<RuleSpec<T>, E> {
        let mut map = |sets: &[S]| sets.iter().map(&mut f).collect::<std::result::Result<Vec<_>, E>>();
        Ok(RuleSpec {
            action: self.action,
            protocol: self.protocol,
            not_protocol: self.not_protocol,
            src_net: self.src_net.clone(),
            not_src_net: self.not_src_net.clone(),
            dst_net: self.dst_net.clone(),
            not_dst_net: self.not_dst_net.clone(),
            src_ports: self.src_ports.clone(),
            not_src_ports: self.not_src_ports.clone(),
            dst_ports: self.dst_ports.clone(),
            not_dst_ports: self.not_dst_ports.clone(),
            src_ipsets: map(&self.src_ipsets)?,
            not_src_ipsets: map(&self.not_src_ipsets)?,
            dst_ipsets: map(&self.dst_ipsets)?,
            not_dst_ipsets: map(&self.not_dst_ipsets)?,
            dst_ip_port_sets: map(&self.dst_ip_port_sets)?,
        })
    }

    pub fn ipsets(&self) -> impl Iterator<Item = &S> {
        self.src_ipsets
            .iter()
            .chain(&self.not_src_ipsets)
            .chain(&self.dst_ipsets)
            .chain(&self.not_dst_ipsets)
            .chain(&self.dst_ip_port_sets)
    }
}

/// Policies applied to one dataplane interface, evaluated in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub ingress_policies: Vec<PolicyHandle>,
    pub egress_policies: Vec<PolicyHandle>,
    pub profiles: Vec<PolicyHandle>,
}

impl InterfaceConfig {
    pub fn is_empty(&self) -> bool {
        self.ingress_policies.is_empty() && self.egress_policies.is_empty() && self.profiles.is_empty()
    }
}

/// The programmable dataplane. Implementations are internally synchronised;
/// every call may be issued from the control loop or from attach/detach.
pub trait Dataplane: Send + Sync {
    fn ipset_create(&self, kind: IpSetType) -> Result<IpSetHandle>;
    fn ipset_add_members(&self, ipset: IpSetHandle, members: &[IpSetMember]) -> Result<()>;
    fn ipset_remove_members(&self, ipset: IpSetHandle, members: &[IpSetMember]) -> Result<()>;
    fn ipset_delete(&self, ipset: IpSetHandle) -> Result<()>;

    fn rule_create(&self, rule: &RuleSpec) -> Result<RuleHandle>;
    fn rule_update(&self, handle: RuleHandle, rule: &RuleSpec) -> Result<()>;
    fn rule_delete(&self, handle: RuleHandle) -> Result<()>;

    fn policy_create(&self, inbound: &[RuleHandle], outbound: &[RuleHandle])
    -> Result<PolicyHandle>;
    fn policy_update(
        &self,
        handle: PolicyHandle,
        inbound: &[RuleHandle],
        outbound: &[RuleHandle],
    ) -> Result<()>;
    fn policy_delete(&self, handle: PolicyHandle) -> Result<()>;

    fn configure_policies(&self, sw_if_index: SwIfIndex, config: &InterfaceConfig) -> Result<()>;

    fn search_interface_with_tag(&self, tag: &str) -> Result<Option<SwIfIndex>>;
    /// Returns every interface whose tag starts with `prefix`, keyed by tag.
    fn search_interfaces_with_tag_prefix(
        &self,
        prefix: &str,
    ) -> Result<ahash::HashMap<String, SwIfIndex>>;
    /// Returns the interfaces tagged with `prefix` that carry one of `addresses`.
    fn search_interfaces_with_addresses(
        &self,
        addresses: &[IpAddr],
        prefix: &str,
    ) -> Result<Vec<SwIfIndex>>;
}
