use ahash::{HashMap, HashMapExt};
use policy_agent_api::proto;

use super::rule::Rule;
use crate::Result;
use crate::dataplane::{Dataplane, IpSetHandle, PolicyHandle, RuleHandle};

/// Ordered inbound and outbound rules. Used for tiered policies, profiles and
/// the node baseline policies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Policy {
    pub inbound: Vec<Rule>,
    pub outbound: Vec<Rule>,
    handle: Option<PolicyHandle>,
}

impl Policy {
    pub fn new(inbound: Vec<Rule>, outbound: Vec<Rule>) -> Self {
        Self {
            inbound,
            outbound,
            handle: None,
        }
    }

    pub fn from_proto_policy(policy: &proto::Policy) -> Result<Self> {
        Ok(Self::new(
            rules_from_proto(&policy.inbound_rules)?,
            rules_from_proto(&policy.outbound_rules)?,
        ))
    }

    pub fn from_proto_profile(profile: &proto::Profile) -> Result<Self> {
        Ok(Self::new(
            rules_from_proto(&profile.inbound_rules)?,
            rules_from_proto(&profile.outbound_rules)?,
        ))
    }

    pub fn handle(&self) -> Option<PolicyHandle> {
        self.handle
    }

    pub fn create(
        &mut self,
        dp: &dyn Dataplane,
        lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
    ) -> Result<PolicyHandle> {
        let inbound = create_rules(&mut self.inbound, dp, lookup)?;
        let outbound = create_rules(&mut self.outbound, dp, lookup)?;
        let handle = dp.policy_create(&inbound, &outbound)?;
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Moves the installed policy to the rules of `new`. Rules are matched by
    /// id within a direction: kept rules retain their handle, new rules are
    /// created, and rules that disappeared are deleted once the policy no
    /// longer references them. On error every rule that still exists in the
    /// dataplane stays tracked, so a later delete releases it.
    pub fn update(
        &mut self,
        dp: &dyn Dataplane,
        new: Policy,
        lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
    ) -> Result<()> {
        let Some(handle) = self.handle else {
            *self = new;
            self.create(dp, lookup)?;
            return Ok(());
        };
        let inbound_stale = update_rules(&mut self.inbound, new.inbound, dp, lookup)?;
        let outbound_stale = match update_rules(&mut self.outbound, new.outbound, dp, lookup) {
            Ok(stale) => stale,
            Err(e) => {
                self.inbound.extend(inbound_stale);
                return Err(e);
            }
        };

        let inbound_handles: Vec<_> = self.inbound.iter().filter_map(Rule::handle).collect();
        let outbound_handles: Vec<_> = self.outbound.iter().filter_map(Rule::handle).collect();
        if let Err(e) = dp.policy_update(handle, &inbound_handles, &outbound_handles) {
            self.inbound.extend(inbound_stale);
            self.outbound.extend(outbound_stale);
            return Err(e.into());
        }

        let inbound = delete_stale(&mut self.inbound, inbound_stale, dp);
        let outbound = delete_stale(&mut self.outbound, outbound_stale, dp);
        inbound.and(outbound)
    }

    pub fn delete(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if let Some(handle) = self.handle {
            dp.policy_delete(handle)?;
            self.handle = None;
        }
        for rule in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            rule.delete(dp)?;
        }
        Ok(())
    }
}

/// Rule ids are unique within a direction. Rules sharing an id get a suffix so
/// identical anonymous rules stay distinct.
fn rules_from_proto(rules: &[proto::Rule]) -> Result<Vec<Rule>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    rules
        .iter()
        .map(|r| {
            let mut rule = Rule::from_proto(r)?;
            let count = seen.entry(rule.id.clone()).or_default();
            if *count > 0 {
                rule.id = format!("{}-{count}", rule.id);
            }
            *count += 1;
            Ok(rule)
        })
        .collect()
}

fn create_rules(
    rules: &mut [Rule],
    dp: &dyn Dataplane,
    lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
) -> Result<Vec<RuleHandle>> {
    rules.iter_mut().map(|r| r.create(dp, lookup)).collect()
}

/// Replaces `rules` with `new`, reusing rules with a matching id. Returns the
/// rules that are no longer wanted. On error `rules` keeps every rule that is
/// installed.
fn update_rules(
    rules: &mut Vec<Rule>,
    new: Vec<Rule>,
    dp: &dyn Dataplane,
    lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
) -> Result<Vec<Rule>> {
    let mut current: HashMap<String, Rule> =
        rules.drain(..).map(|r| (r.id.clone(), r)).collect();
    let merged = merge_rules(rules, &mut current, new, dp, lookup);
    let stale: Vec<Rule> = current.into_values().collect();
    match merged {
        Ok(()) => Ok(stale),
        Err(e) => {
            rules.extend(stale);
            Err(e)
        }
    }
}

fn merge_rules(
    rules: &mut Vec<Rule>,
    current: &mut HashMap<String, Rule>,
    new: Vec<Rule>,
    dp: &dyn Dataplane,
    lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
) -> Result<()> {
    for rule in new {
        match current.remove(&rule.id) {
            Some(mut existing) => {
                let updated = existing.update(dp, rule, lookup);
                rules.push(existing);
                updated?;
            }
            None => {
                let mut rule = rule;
                rule.create(dp, lookup)?;
                rules.push(rule);
            }
        }
    }
    Ok(())
}

/// Deletes rules the policy stopped referencing. Rules the dataplane refuses
/// to delete go back to `rules`.
fn delete_stale(rules: &mut Vec<Rule>, stale: Vec<Rule>, dp: &dyn Dataplane) -> Result<()> {
    let mut result = Ok(());
    for mut rule in stale {
        if let Err(e) = rule.delete(dp) {
            rules.push(rule);
            result = result.and(Err(e));
        }
    }
    result
}
