//! Messages sent by the policy engine over the control socket.
//!
//! Every frame carries one [`ToDataplane`] envelope whose payload is one of
//! the [`Message`] variants.

use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ToDataplane {
    #[prost(uint64, tag = "15")]
    pub sequence_number: u64,

    #[prost(
        oneof = "Message",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 18, 19, 20, 21, 22"
    )]
    pub payload: Option<Message>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Message {
    #[prost(message, tag = "1")]
    InSync(InSync),
    #[prost(message, tag = "2")]
    IpSetUpdate(IpSetUpdate),
    #[prost(message, tag = "3")]
    IpSetDeltaUpdate(IpSetDeltaUpdate),
    #[prost(message, tag = "4")]
    IpSetRemove(IpSetRemove),
    #[prost(message, tag = "5")]
    ActiveProfileUpdate(ActiveProfileUpdate),
    #[prost(message, tag = "6")]
    ActiveProfileRemove(ActiveProfileRemove),
    #[prost(message, tag = "7")]
    ActivePolicyUpdate(ActivePolicyUpdate),
    #[prost(message, tag = "8")]
    ActivePolicyRemove(ActivePolicyRemove),
    #[prost(message, tag = "9")]
    HostEndpointUpdate(HostEndpointUpdate),
    #[prost(message, tag = "10")]
    HostEndpointRemove(HostEndpointRemove),
    #[prost(message, tag = "11")]
    WorkloadEndpointUpdate(WorkloadEndpointUpdate),
    #[prost(message, tag = "12")]
    WorkloadEndpointRemove(WorkloadEndpointRemove),
    #[prost(message, tag = "13")]
    ConfigUpdate(ConfigUpdate),
    #[prost(message, tag = "14")]
    HostMetadataUpdate(HostMetadataUpdate),
    #[prost(message, tag = "16")]
    IpamPoolUpdate(IpamPoolUpdate),
    #[prost(message, tag = "17")]
    IpamPoolRemove(IpamPoolRemove),
    #[prost(message, tag = "18")]
    HostMetadataRemove(HostMetadataRemove),
    #[prost(message, tag = "19")]
    ServiceAccountUpdate(ServiceAccountUpdate),
    #[prost(message, tag = "20")]
    ServiceAccountRemove(ServiceAccountRemove),
    #[prost(message, tag = "21")]
    NamespaceUpdate(NamespaceUpdate),
    #[prost(message, tag = "22")]
    NamespaceRemove(NamespaceRemove),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfigUpdate {
    #[prost(map = "string, string", tag = "1")]
    pub config: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InSync {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum IpSetType {
    Ip = 0,
    IpAndPort = 1,
    Net = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpSetUpdate {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, repeated, tag = "2")]
    pub members: Vec<String>,
    #[prost(enumeration = "IpSetType", tag = "3")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpSetDeltaUpdate {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, repeated, tag = "2")]
    pub added_members: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub removed_members: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpSetRemove {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProfileId {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Profile {
    #[prost(message, repeated, tag = "1")]
    pub inbound_rules: Vec<Rule>,
    #[prost(message, repeated, tag = "2")]
    pub outbound_rules: Vec<Rule>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActiveProfileUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<ProfileId>,
    #[prost(message, optional, tag = "2")]
    pub profile: Option<Profile>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActiveProfileRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<ProfileId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PolicyId {
    #[prost(string, tag = "1")]
    pub tier: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Policy {
    #[prost(message, repeated, tag = "1")]
    pub inbound_rules: Vec<Rule>,
    #[prost(message, repeated, tag = "2")]
    pub outbound_rules: Vec<Rule>,
    #[prost(bool, tag = "3")]
    pub untracked: bool,
    #[prost(bool, tag = "4")]
    pub pre_dnat: bool,
    #[prost(bool, tag = "5")]
    pub apply_on_forward: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActivePolicyUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<PolicyId>,
    #[prost(message, optional, tag = "2")]
    pub policy: Option<Policy>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActivePolicyRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<PolicyId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rule {
    #[prost(string, tag = "1")]
    pub action: String,
    #[prost(message, optional, tag = "3")]
    pub protocol: Option<Protocol>,
    #[prost(string, repeated, tag = "4")]
    pub src_net: Vec<String>,
    #[prost(message, repeated, tag = "5")]
    pub src_ports: Vec<PortRange>,
    #[prost(string, repeated, tag = "7")]
    pub dst_net: Vec<String>,
    #[prost(message, repeated, tag = "8")]
    pub dst_ports: Vec<PortRange>,
    #[prost(string, repeated, tag = "12")]
    pub src_ip_set_ids: Vec<String>,
    #[prost(string, repeated, tag = "13")]
    pub dst_ip_set_ids: Vec<String>,
    #[prost(string, repeated, tag = "14")]
    pub dst_ip_port_set_ids: Vec<String>,
    #[prost(message, optional, tag = "102")]
    pub not_protocol: Option<Protocol>,
    #[prost(string, repeated, tag = "103")]
    pub not_src_net: Vec<String>,
    #[prost(message, repeated, tag = "104")]
    pub not_src_ports: Vec<PortRange>,
    #[prost(string, repeated, tag = "105")]
    pub not_dst_net: Vec<String>,
    #[prost(message, repeated, tag = "106")]
    pub not_dst_ports: Vec<PortRange>,
    #[prost(string, repeated, tag = "109")]
    pub not_src_ip_set_ids: Vec<String>,
    #[prost(string, repeated, tag = "110")]
    pub not_dst_ip_set_ids: Vec<String>,
    #[prost(string, tag = "201")]
    pub rule_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Protocol {
    #[prost(oneof = "protocol::NumberOrName", tags = "1, 2")]
    pub number_or_name: Option<protocol::NumberOrName>,
}

pub mod protocol {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum NumberOrName {
        #[prost(int32, tag = "1")]
        Number(i32),
        #[prost(string, tag = "2")]
        Name(String),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PortRange {
    #[prost(int32, tag = "1")]
    pub first: i32,
    #[prost(int32, tag = "2")]
    pub last: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TierInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub ingress_policies: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub egress_policies: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostEndpointId {
    #[prost(string, tag = "1")]
    pub endpoint_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostEndpoint {
    /// Interface name, `*` for every uplink, or empty to match on the
    /// expected addresses.
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub profile_ids: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub tiers: Vec<TierInfo>,
    #[prost(string, repeated, tag = "4")]
    pub expected_ipv4_addrs: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub expected_ipv6_addrs: Vec<String>,
    #[prost(message, repeated, tag = "6")]
    pub untracked_tiers: Vec<TierInfo>,
    #[prost(message, repeated, tag = "7")]
    pub pre_dnat_tiers: Vec<TierInfo>,
    #[prost(message, repeated, tag = "8")]
    pub forward_tiers: Vec<TierInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostEndpointUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<HostEndpointId>,
    #[prost(message, optional, tag = "3")]
    pub endpoint: Option<HostEndpoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostEndpointRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<HostEndpointId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkloadEndpointId {
    #[prost(string, tag = "2")]
    pub orchestrator_id: String,
    #[prost(string, tag = "3")]
    pub workload_id: String,
    #[prost(string, tag = "4")]
    pub endpoint_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkloadEndpoint {
    #[prost(string, tag = "1")]
    pub state: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac: String,
    #[prost(string, repeated, tag = "4")]
    pub profile_ids: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub ipv4_nets: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub ipv6_nets: Vec<String>,
    #[prost(message, repeated, tag = "7")]
    pub tiers: Vec<TierInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkloadEndpointUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<WorkloadEndpointId>,
    #[prost(message, optional, tag = "5")]
    pub endpoint: Option<WorkloadEndpoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkloadEndpointRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<WorkloadEndpointId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostMetadataUpdate {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, tag = "2")]
    pub ipv4_addr: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostMetadataRemove {
    #[prost(string, tag = "1")]
    pub hostname: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpamPool {
    #[prost(string, tag = "1")]
    pub cidr: String,
    #[prost(bool, tag = "2")]
    pub masquerade: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpamPoolUpdate {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub pool: Option<IpamPool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpamPoolRemove {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceAccountId {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceAccountUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<ServiceAccountId>,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceAccountRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<ServiceAccountId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NamespaceId {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NamespaceUpdate {
    #[prost(message, optional, tag = "1")]
    pub id: Option<NamespaceId>,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NamespaceRemove {
    #[prost(message, optional, tag = "1")]
    pub id: Option<NamespaceId>,
}
