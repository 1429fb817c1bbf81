pub mod codec;
pub mod proto;

pub use proto::{Message, ToDataplane};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("message {0} has no payload")]
    EmptyPayload(u64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl TryFrom<ToDataplane> for Message {
    type Error = Error;

    fn try_from(envelope: ToDataplane) -> Result<Self> {
        envelope
            .payload
            .ok_or(Error::EmptyPayload(envelope.sequence_number))
    }
}

impl Message {
    /// Short name of the message, used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::InSync(_) => "in_sync",
            Message::ConfigUpdate(_) => "config_update",
            Message::IpSetUpdate(_) => "ipset_update",
            Message::IpSetDeltaUpdate(_) => "ipset_delta_update",
            Message::IpSetRemove(_) => "ipset_remove",
            Message::ActiveProfileUpdate(_) => "active_profile_update",
            Message::ActiveProfileRemove(_) => "active_profile_remove",
            Message::ActivePolicyUpdate(_) => "active_policy_update",
            Message::ActivePolicyRemove(_) => "active_policy_remove",
            Message::HostEndpointUpdate(_) => "host_endpoint_update",
            Message::HostEndpointRemove(_) => "host_endpoint_remove",
            Message::WorkloadEndpointUpdate(_) => "workload_endpoint_update",
            Message::WorkloadEndpointRemove(_) => "workload_endpoint_remove",
            Message::HostMetadataUpdate(_) => "host_metadata_update",
            Message::HostMetadataRemove(_) => "host_metadata_remove",
            Message::IpamPoolUpdate(_) => "ipam_pool_update",
            Message::IpamPoolRemove(_) => "ipam_pool_remove",
            Message::ServiceAccountUpdate(_) => "service_account_update",
            Message::ServiceAccountRemove(_) => "service_account_remove",
            Message::NamespaceUpdate(_) => "namespace_update",
            Message::NamespaceRemove(_) => "namespace_remove",
        }
    }
}
