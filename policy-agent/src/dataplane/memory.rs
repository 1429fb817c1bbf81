use std::fmt::Display;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::{HashMap, HashSet, HashSetExt};

use super::{
    Dataplane, Error, InterfaceConfig, IpSetHandle, IpSetMember, IpSetType, PolicyHandle, Result,
    RuleHandle, RuleSpec, SwIfIndex,
};

/// Dataplane operations, used to inject failures and to inspect the call log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    IpSetCreate,
    IpSetAddMembers,
    IpSetRemoveMembers,
    IpSetDelete,
    RuleCreate,
    RuleUpdate,
    RuleDelete,
    PolicyCreate,
    PolicyUpdate,
    PolicyDelete,
    ConfigurePolicies,
    SearchInterfaces,
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    IpSetCreate(IpSetHandle),
    IpSetAddMembers(IpSetHandle, usize),
    IpSetRemoveMembers(IpSetHandle, usize),
    IpSetDelete(IpSetHandle),
    RuleCreate(RuleHandle),
    RuleUpdate(RuleHandle),
    RuleDelete(RuleHandle),
    PolicyCreate(PolicyHandle),
    PolicyUpdate(PolicyHandle),
    PolicyDelete(PolicyHandle),
    ConfigurePolicies(SwIfIndex, InterfaceConfig),
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::IpSetCreate(_) => Op::IpSetCreate,
            Call::IpSetAddMembers(..) => Op::IpSetAddMembers,
            Call::IpSetRemoveMembers(..) => Op::IpSetRemoveMembers,
            Call::IpSetDelete(_) => Op::IpSetDelete,
            Call::RuleCreate(_) => Op::RuleCreate,
            Call::RuleUpdate(_) => Op::RuleUpdate,
            Call::RuleDelete(_) => Op::RuleDelete,
            Call::PolicyCreate(_) => Op::PolicyCreate,
            Call::PolicyUpdate(_) => Op::PolicyUpdate,
            Call::PolicyDelete(_) => Op::PolicyDelete,
            Call::ConfigurePolicies(..) => Op::ConfigurePolicies,
        }
    }
}

#[derive(Clone, Debug)]
struct Interface {
    tag: String,
    addresses: Vec<IpAddr>,
}

/// In-process dataplane that keeps every object in memory. It enforces the
/// same referential checks as the real one: an IP set referenced by a rule
/// cannot be deleted and a rule referenced by a policy cannot be deleted.
#[derive(Clone, Default)]
pub struct MemoryDataplane {
    state: Arc<Mutex<MemoryDataplaneInner>>,
}

#[derive(Default)]
struct MemoryDataplaneInner {
    next_id: u32,
    ipsets: HashMap<IpSetHandle, (IpSetType, HashSet<IpSetMember>)>,
    rules: HashMap<RuleHandle, RuleSpec>,
    policies: HashMap<PolicyHandle, (Vec<RuleHandle>, Vec<RuleHandle>)>,
    interfaces: HashMap<SwIfIndex, Interface>,
    configs: HashMap<SwIfIndex, InterfaceConfig>,
    failures: HashSet<Op>,
    calls: Vec<Call>,
}

impl MemoryDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDataplaneInner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an interface so the interface searches can find it.
    pub fn add_interface(&self, sw_if_index: SwIfIndex, tag: &str, addresses: &[IpAddr]) {
        let mut guard = self.lock();
        guard.interfaces.insert(
            sw_if_index,
            Interface {
                tag: tag.to_string(),
                addresses: addresses.to_vec(),
            },
        );
    }

    pub fn remove_interface(&self, sw_if_index: SwIfIndex) {
        let mut guard = self.lock();
        guard.interfaces.remove(&sw_if_index);
        guard.configs.remove(&sw_if_index);
    }

    /// Makes every subsequent call of `op` fail until cleared.
    pub fn fail(&self, op: Op) {
        self.lock().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn interface_config(&self, sw_if_index: SwIfIndex) -> Option<InterfaceConfig> {
        self.lock().configs.get(&sw_if_index).cloned()
    }

    pub fn ipset_members(&self, ipset: IpSetHandle) -> Option<Vec<IpSetMember>> {
        let guard = self.lock();
        let (_, members) = guard.ipsets.get(&ipset)?;
        let mut members: Vec<_> = members.iter().cloned().collect();
        members.sort();
        Some(members)
    }

    pub fn rule(&self, rule: RuleHandle) -> Option<RuleSpec> {
        self.lock().rules.get(&rule).cloned()
    }

    pub fn policy_rules(&self, policy: PolicyHandle) -> Option<(Vec<RuleHandle>, Vec<RuleHandle>)> {
        self.lock().policies.get(&policy).cloned()
    }

    /// Number of live objects as (ipsets, rules, policies).
    pub fn object_counts(&self) -> (usize, usize, usize) {
        let guard = self.lock();
        (guard.ipsets.len(), guard.rules.len(), guard.policies.len())
    }
}

impl MemoryDataplaneInner {
    fn check(&self, op: Op) -> Result<()> {
        if self.failures.contains(&op) {
            return Err(Error::Injected(op));
        }
        Ok(())
    }

    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn ipset_mut(&mut self, ipset: IpSetHandle) -> Result<&mut HashSet<IpSetMember>> {
        self.ipsets
            .get_mut(&ipset)
            .map(|(_, members)| members)
            .ok_or(Error::NotFound {
                kind: "ipset",
                id: ipset.0,
            })
    }

    fn check_rule_refs(&self, rule: &RuleSpec) -> Result<()> {
        for ipset in rule.ipsets() {
            if !self.ipsets.contains_key(ipset) {
                return Err(Error::NotFound {
                    kind: "ipset",
                    id: ipset.0,
                });
            }
        }
        Ok(())
    }

    fn check_policy_refs(&self, inbound: &[RuleHandle], outbound: &[RuleHandle]) -> Result<()> {
        for rule in inbound.iter().chain(outbound) {
            if !self.rules.contains_key(rule) {
                return Err(Error::NotFound {
                    kind: "rule",
                    id: rule.0,
                });
            }
        }
        Ok(())
    }
}

impl Dataplane for MemoryDataplane {
    fn ipset_create(&self, kind: IpSetType) -> Result<IpSetHandle> {
        let mut guard = self.lock();
        guard.check(Op::IpSetCreate)?;
        let handle = IpSetHandle(guard.allocate());
        guard.ipsets.insert(handle, (kind, HashSet::new()));
        guard.calls.push(Call::IpSetCreate(handle));
        Ok(handle)
    }

    fn ipset_add_members(&self, ipset: IpSetHandle, members: &[IpSetMember]) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::IpSetAddMembers)?;
        guard.ipset_mut(ipset)?.extend(members.iter().cloned());
        guard.calls.push(Call::IpSetAddMembers(ipset, members.len()));
        Ok(())
    }

    fn ipset_remove_members(&self, ipset: IpSetHandle, members: &[IpSetMember]) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::IpSetRemoveMembers)?;
        let set = guard.ipset_mut(ipset)?;
        for member in members {
            set.remove(member);
        }
        guard
            .calls
            .push(Call::IpSetRemoveMembers(ipset, members.len()));
        Ok(())
    }

    fn ipset_delete(&self, ipset: IpSetHandle) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::IpSetDelete)?;
        if guard
            .rules
            .values()
            .any(|rule| rule.ipsets().any(|s| *s == ipset))
        {
            return Err(Error::InUse {
                kind: "ipset",
                id: ipset.0,
            });
        }
        if guard.ipsets.remove(&ipset).is_none() {
            return Err(Error::NotFound {
                kind: "ipset",
                id: ipset.0,
            });
        }
        guard.calls.push(Call::IpSetDelete(ipset));
        Ok(())
    }

    fn rule_create(&self, rule: &RuleSpec) -> Result<RuleHandle> {
        let mut guard = self.lock();
        guard.check(Op::RuleCreate)?;
        guard.check_rule_refs(rule)?;
        let handle = RuleHandle(guard.allocate());
        guard.rules.insert(handle, rule.clone());
        guard.calls.push(Call::RuleCreate(handle));
        Ok(handle)
    }

    fn rule_update(&self, handle: RuleHandle, rule: &RuleSpec) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::RuleUpdate)?;
        guard.check_rule_refs(rule)?;
        let Some(current) = guard.rules.get_mut(&handle) else {
            return Err(Error::NotFound {
                kind: "rule",
                id: handle.0,
            });
        };
        *current = rule.clone();
        guard.calls.push(Call::RuleUpdate(handle));
        Ok(())
    }

    fn rule_delete(&self, handle: RuleHandle) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::RuleDelete)?;
        if guard
            .policies
            .values()
            .any(|(inbound, outbound)| inbound.contains(&handle) || outbound.contains(&handle))
        {
            return Err(Error::InUse {
                kind: "rule",
                id: handle.0,
            });
        }
        if guard.rules.remove(&handle).is_none() {
            return Err(Error::NotFound {
                kind: "rule",
                id: handle.0,
            });
        }
        guard.calls.push(Call::RuleDelete(handle));
        Ok(())
    }

    fn policy_create(
        &self,
        inbound: &[RuleHandle],
        outbound: &[RuleHandle],
    ) -> Result<PolicyHandle> {
        let mut guard = self.lock();
        guard.check(Op::PolicyCreate)?;
        guard.check_policy_refs(inbound, outbound)?;
        let handle = PolicyHandle(guard.allocate());
        guard
            .policies
            .insert(handle, (inbound.to_vec(), outbound.to_vec()));
        guard.calls.push(Call::PolicyCreate(handle));
        Ok(handle)
    }

    fn policy_update(
        &self,
        handle: PolicyHandle,
        inbound: &[RuleHandle],
        outbound: &[RuleHandle],
    ) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::PolicyUpdate)?;
        guard.check_policy_refs(inbound, outbound)?;
        let Some(current) = guard.policies.get_mut(&handle) else {
            return Err(Error::NotFound {
                kind: "policy",
                id: handle.0,
            });
        };
        *current = (inbound.to_vec(), outbound.to_vec());
        guard.calls.push(Call::PolicyUpdate(handle));
        Ok(())
    }

    fn policy_delete(&self, handle: PolicyHandle) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::PolicyDelete)?;
        if guard.policies.remove(&handle).is_none() {
            return Err(Error::NotFound {
                kind: "policy",
                id: handle.0,
            });
        }
        guard.calls.push(Call::PolicyDelete(handle));
        Ok(())
    }

    fn configure_policies(&self, sw_if_index: SwIfIndex, config: &InterfaceConfig) -> Result<()> {
        let mut guard = self.lock();
        guard.check(Op::ConfigurePolicies)?;
        if !guard.interfaces.contains_key(&sw_if_index) {
            return Err(Error::NoSuchInterface(sw_if_index));
        }
        if config.is_empty() {
            guard.configs.remove(&sw_if_index);
        } else {
            guard.configs.insert(sw_if_index, config.clone());
        }
        guard
            .calls
            .push(Call::ConfigurePolicies(sw_if_index, config.clone()));
        Ok(())
    }

    fn search_interface_with_tag(&self, tag: &str) -> Result<Option<SwIfIndex>> {
        let guard = self.lock();
        guard.check(Op::SearchInterfaces)?;
        Ok(guard
            .interfaces
            .iter()
            .find(|(_, i)| i.tag == tag)
            .map(|(idx, _)| *idx))
    }

    fn search_interfaces_with_tag_prefix(
        &self,
        prefix: &str,
    ) -> Result<HashMap<String, SwIfIndex>> {
        let guard = self.lock();
        guard.check(Op::SearchInterfaces)?;
        Ok(guard
            .interfaces
            .iter()
            .filter(|(_, i)| i.tag.starts_with(prefix))
            .map(|(idx, i)| (i.tag.clone(), *idx))
            .collect())
    }

    fn search_interfaces_with_addresses(
        &self,
        addresses: &[IpAddr],
        prefix: &str,
    ) -> Result<Vec<SwIfIndex>> {
        let guard = self.lock();
        guard.check(Op::SearchInterfaces)?;
        let mut found: Vec<_> = guard
            .interfaces
            .iter()
            .filter(|(_, i)| i.tag.starts_with(prefix))
            .filter(|(_, i)| i.addresses.iter().any(|a| addresses.contains(a)))
            .map(|(idx, _)| *idx)
            .collect();
        found.sort_unstable();
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_ipset_referenced_by_rule_cannot_be_deleted() {
        let dp = MemoryDataplane::new();
        let set = dp.ipset_create(IpSetType::Ip).unwrap();
        let rule = dp
            .rule_create(&RuleSpec {
                src_ipsets: vec![set],
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(dp.ipset_delete(set), Err(Error::InUse { .. })));
        dp.rule_delete(rule).unwrap();
        dp.ipset_delete(set).unwrap();
        assert_eq!(dp.object_counts(), (0, 0, 0));
    }

    #[test]
    fn test_rule_referenced_by_policy_cannot_be_deleted() {
        let dp = MemoryDataplane::new();
        let rule = dp.rule_create(&RuleSpec::default()).unwrap();
        let policy = dp.policy_create(&[rule], &[]).unwrap();

        assert!(dp.rule_delete(rule).is_err());
        dp.policy_delete(policy).unwrap();
        dp.rule_delete(rule).unwrap();
    }

    #[test]
    fn test_rule_with_unknown_ipset_is_rejected() {
        let dp = MemoryDataplane::new();
        let err = dp
            .rule_create(&RuleSpec {
                dst_ipsets: vec![IpSetHandle(99)],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "ipset", .. }));
    }

    #[test]
    fn test_injected_failure() {
        let dp = MemoryDataplane::new();
        dp.fail(Op::IpSetCreate);
        assert!(matches!(
            dp.ipset_create(IpSetType::Net),
            Err(Error::Injected(Op::IpSetCreate))
        ));
        dp.clear_failures();
        dp.ipset_create(IpSetType::Net).unwrap();
        assert_eq!(dp.count(Op::IpSetCreate), 1);
    }

    #[test]
    fn test_interface_search() {
        let dp = MemoryDataplane::new();
        let node = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        dp.add_interface(1, "main-eth0", &[node]);
        dp.add_interface(2, "host-eth0", &[]);
        dp.add_interface(3, "main-eth1", &[]);

        assert_eq!(dp.search_interface_with_tag("host-eth0").unwrap(), Some(2));
        assert_eq!(dp.search_interface_with_tag("host-eth9").unwrap(), None);
        assert_eq!(dp.search_interfaces_with_tag_prefix("main-").unwrap().len(), 2);
        assert_eq!(
            dp.search_interfaces_with_addresses(&[node], "main-").unwrap(),
            vec![1]
        );

        let conf = InterfaceConfig {
            ingress_policies: vec![PolicyHandle(7)],
            ..Default::default()
        };
        dp.configure_policies(1, &conf).unwrap();
        assert_eq!(dp.interface_config(1), Some(conf));
        dp.configure_policies(1, &InterfaceConfig::default()).unwrap();
        assert_eq!(dp.interface_config(1), None);
        assert!(dp.configure_policies(42, &InterfaceConfig::default()).is_err());
    }
}
