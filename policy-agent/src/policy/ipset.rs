use std::collections::BTreeSet;

use policy_agent_api::proto;
use tracing::debug;

use crate::dataplane::{Dataplane, IpSetHandle, IpSetMember, IpSetType};
use crate::{Error, Result};

/// A named set of addresses referenced by rules.
#[derive(Clone, Debug, PartialEq)]
pub struct IpSet {
    pub kind: IpSetType,
    members: BTreeSet<IpSetMember>,
    handle: Option<IpSetHandle>,
}

impl IpSet {
    pub fn new(kind: IpSetType) -> Self {
        Self {
            kind,
            members: BTreeSet::new(),
            handle: None,
        }
    }

    pub fn from_proto(msg: &proto::IpSetUpdate) -> Result<Self> {
        let kind = match proto::IpSetType::try_from(msg.r#type) {
            Ok(proto::IpSetType::Ip) => IpSetType::Ip,
            Ok(proto::IpSetType::IpAndPort) => IpSetType::IpPort,
            Ok(proto::IpSetType::Net) => IpSetType::Net,
            Err(_) => {
                return Err(Error::Protocol(format!(
                    "ipset {} has unknown type {}",
                    msg.id, msg.r#type
                )));
            }
        };
        let mut set = Self::new(kind);
        set.members = parse_members(kind, &msg.members)?.into_iter().collect();
        Ok(set)
    }

    pub fn handle(&self) -> Option<IpSetHandle> {
        self.handle
    }

    pub fn members(&self) -> impl Iterator<Item = &IpSetMember> {
        self.members.iter()
    }

    pub fn parse_members(&self, members: &[String]) -> Result<Vec<IpSetMember>> {
        parse_members(self.kind, members)
    }

    pub fn create(&mut self, dp: &dyn Dataplane) -> Result<()> {
        let handle = dp.ipset_create(self.kind)?;
        self.handle = Some(handle);
        if !self.members.is_empty() {
            let members: Vec<_> = self.members.iter().cloned().collect();
            dp.ipset_add_members(handle, &members)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if let Some(handle) = self.handle {
            dp.ipset_delete(handle)?;
            self.handle = None;
        }
        Ok(())
    }

    /// Adds members, programming the dataplane when the set is installed.
    pub fn add_members(&mut self, members: Vec<IpSetMember>, dp: Option<&dyn Dataplane>) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        if let (Some(dp), Some(handle)) = (dp, self.handle) {
            dp.ipset_add_members(handle, &members)?;
        }
        self.members.extend(members);
        Ok(())
    }

    /// Removes members, programming the dataplane when the set is installed.
    pub fn remove_members(&mut self, members: Vec<IpSetMember>, dp: Option<&dyn Dataplane>) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        if let (Some(dp), Some(handle)) = (dp, self.handle) {
            dp.ipset_remove_members(handle, &members)?;
        }
        for member in &members {
            if !self.members.remove(member) {
                debug!(%member, "removing member not in ipset");
            }
        }
        Ok(())
    }

    /// Applies a delta update as `members ∪ added \ removed`. Additions go
    /// first so a member listed in both ends up absent.
    pub fn apply_delta(
        &mut self,
        added: Vec<IpSetMember>,
        removed: Vec<IpSetMember>,
        dp: Option<&dyn Dataplane>,
    ) -> Result<()> {
        self.add_members(added, dp)?;
        self.remove_members(removed, dp)
    }
}

fn parse_members(kind: IpSetType, members: &[String]) -> Result<Vec<IpSetMember>> {
    members
        .iter()
        .map(|m| IpSetMember::parse(kind, m).map_err(|e| Error::Protocol(e.to_string())))
        .collect()
}
