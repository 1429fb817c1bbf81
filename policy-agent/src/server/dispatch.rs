use policy_agent_api::{Message, proto};
use tracing::{debug, info};

use super::{AgentState, SyncState, TunnelChange};
use crate::dataplane::Dataplane;
use crate::{Error, Result};

impl AgentState {
    /// Handles one message from the policy engine. An error leaves the local
    /// state untrustworthy and the connection must be dropped.
    pub(crate) fn dispatch(&mut self, dp: &dyn Dataplane, message: Message) -> Result<()> {
        let kind = message.kind();
        debug!(kind, state = %self.sync, "received message");
        let result = self.handle_message(dp, message);
        self.metrics.message(kind, result.is_ok());
        result
    }

    fn handle_message(&mut self, dp: &dyn Dataplane, message: Message) -> Result<()> {
        match message {
            Message::ConfigUpdate(msg) => self.handle_config_update(dp, msg),
            Message::InSync(_) => self.handle_in_sync(dp),
            Message::IpSetUpdate(msg) => {
                self.entity(|s, pending| s.handle_ipset_update(dp, msg, pending))
            }
            Message::IpSetDeltaUpdate(msg) => {
                self.entity(|s, pending| s.handle_ipset_delta(dp, msg, pending))
            }
            Message::IpSetRemove(msg) => {
                self.entity(|s, pending| s.handle_ipset_remove(dp, msg, pending))
            }
            Message::ActiveProfileUpdate(msg) => {
                self.entity(|s, pending| s.handle_profile_update(dp, msg, pending))
            }
            Message::ActiveProfileRemove(msg) => {
                self.entity(|s, pending| s.handle_profile_remove(dp, msg, pending))
            }
            Message::ActivePolicyUpdate(msg) => {
                self.entity(|s, pending| s.handle_policy_update(dp, msg, pending))
            }
            Message::ActivePolicyRemove(msg) => {
                self.entity(|s, pending| s.handle_policy_remove(dp, msg, pending))
            }
            Message::HostEndpointUpdate(msg) => {
                self.entity(|s, pending| s.handle_host_endpoint_update(dp, msg, pending))
            }
            Message::HostEndpointRemove(msg) => {
                self.entity(|s, pending| s.handle_host_endpoint_remove(dp, msg, pending))
            }
            Message::WorkloadEndpointUpdate(msg) => {
                self.entity(|s, pending| s.handle_workload_endpoint_update(dp, msg, pending))
            }
            Message::WorkloadEndpointRemove(msg) => {
                self.entity(|s, pending| s.handle_workload_endpoint_remove(dp, msg, pending))
            }
            // no dataplane configuration for these
            Message::HostMetadataUpdate(_)
            | Message::HostMetadataRemove(_)
            | Message::IpamPoolUpdate(_)
            | Message::IpamPoolRemove(_)
            | Message::ServiceAccountUpdate(_)
            | Message::ServiceAccountRemove(_)
            | Message::NamespaceUpdate(_)
            | Message::NamespaceRemove(_) => self.entity(|_, _| Ok(())),
        }
    }

    /// Runs an entity handler against the generation selected by the sync
    /// state. Entity messages are dropped when policies are disabled.
    fn entity(&mut self, handler: impl FnOnce(&mut Self, bool) -> Result<()>) -> Result<()> {
        if !self.config.enable_policies {
            debug!("policies disabled, dropping message");
            return Ok(());
        }
        let pending = self.pending()?;
        handler(self, pending)
    }

    fn handle_config_update(&mut self, dp: &dyn Dataplane, msg: proto::ConfigUpdate) -> Result<()> {
        if self.sync != SyncState::Connected {
            return Err(Error::Protocol(format!(
                "config update received in state {}",
                self.sync
            )));
        }
        info!("received configuration from policy engine, syncing");
        self.sync = SyncState::Syncing;
        let mut config = self.config.clone();
        config.apply_engine_config(&msg.config);
        self.baseline.recreate_failsafe(dp, &config)?;
        self.config = config;
        Ok(())
    }

    fn handle_in_sync(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if self.sync != SyncState::Syncing {
            return Err(Error::Protocol(format!(
                "in sync received in state {}",
                self.sync
            )));
        }
        info!("policy engine in sync, applying pending state");
        self.sync = SyncState::InSync;
        let result = self.apply_pending_state(dp);
        self.metrics.reconciliation(result.is_ok());
        result
    }

    /// Tracks a tunnel interface and applies the change to the host endpoints
    /// of the current generation. Removed tunnels keep their configuration
    /// until the interface itself goes away.
    pub(crate) fn handle_tunnel_change(
        &mut self,
        dp: &dyn Dataplane,
        change: TunnelChange,
    ) -> Result<()> {
        match change {
            TunnelChange::Added(sw_if_index) => self.tunnels.insert(sw_if_index),
            TunnelChange::Removed(sw_if_index) => self.tunnels.remove(&sw_if_index),
        };
        let Ok(pending) = self.pending() else {
            debug!(?change, state = %self.sync, "no policy generation for tunnel change");
            return Ok(());
        };
        for hep in self.store.current(pending).host_endpoints.values_mut() {
            match change {
                TunnelChange::Added(sw_if_index) => hep.add_tunnel(dp, sw_if_index)?,
                TunnelChange::Removed(sw_if_index) => hep.remove_tunnel(sw_if_index),
            }
        }
        Ok(())
    }
}
