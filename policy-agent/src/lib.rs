pub mod baseline;
pub mod config;
pub mod dataplane;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod server;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no interface to configure as host endpoint {0}")]
    NoHostEndpointInterfaces(String),

    #[error("uplink interface {0} has no matching tap interface")]
    MissingTap(String),

    #[error("dataplane error: {0}")]
    Dataplane(#[from] dataplane::Error),

    #[error("failsafe has wrong format: {0}")]
    Failsafe(String),

    #[error("failed to reconcile {entity}: {source}")]
    Reconcile {
        entity: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Message(#[from] policy_agent_api::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("invalid network: {0}")]
    Network(#[from] ipnetwork::IpNetworkError),

    #[error("unable to send event due to channel error")]
    ChannelError,

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches a description of the failed operation to an error, the way the
/// handlers report which entity a dataplane call was made for.
pub(crate) trait ResultExt<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: context(),
            source: Box::new(e.into()),
        })
    }
}
