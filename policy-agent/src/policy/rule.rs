use std::hash::{DefaultHasher, Hash, Hasher};

use ipnetwork::IpNetwork;
use policy_agent_api::proto;

use crate::dataplane::{
    Dataplane, IpSetHandle, PortRange, RuleAction, RuleHandle, RuleSpec, parse_net,
    parse_protocol_name,
};
use crate::{Error, Result};

/// A rule as received from the policy engine. IP sets are referenced by name
/// until the rule is installed.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub id: String,
    pub spec: RuleSpec<String>,
    handle: Option<RuleHandle>,
}

impl Rule {
    pub fn new(id: impl Into<String>, spec: RuleSpec<String>) -> Self {
        Self {
            id: id.into(),
            spec,
            handle: None,
        }
    }

    pub fn from_proto(rule: &proto::Rule) -> Result<Self> {
        let spec = RuleSpec {
            action: rule
                .action
                .parse::<RuleAction>()
                .map_err(|e| Error::Protocol(e.to_string()))?,
            protocol: rule.protocol.as_ref().map(parse_protocol).transpose()?,
            not_protocol: rule.not_protocol.as_ref().map(parse_protocol).transpose()?,
            src_net: parse_nets(&rule.src_net)?,
            not_src_net: parse_nets(&rule.not_src_net)?,
            dst_net: parse_nets(&rule.dst_net)?,
            not_dst_net: parse_nets(&rule.not_dst_net)?,
            src_ports: parse_ports(&rule.src_ports)?,
            not_src_ports: parse_ports(&rule.not_src_ports)?,
            dst_ports: parse_ports(&rule.dst_ports)?,
            not_dst_ports: parse_ports(&rule.not_dst_ports)?,
            src_ipsets: rule.src_ip_set_ids.clone(),
            not_src_ipsets: rule.not_src_ip_set_ids.clone(),
            dst_ipsets: rule.dst_ip_set_ids.clone(),
            not_dst_ipsets: rule.not_dst_ip_set_ids.clone(),
            dst_ip_port_sets: rule.dst_ip_port_set_ids.clone(),
        };
        let id = if rule.rule_id.is_empty() {
            content_key(&spec)
        } else {
            rule.rule_id.clone()
        };
        Ok(Self::new(id, spec))
    }

    pub fn handle(&self) -> Option<RuleHandle> {
        self.handle
    }

    /// Resolves IP set names through `lookup`. A name with no installed set
    /// is an error.
    pub fn resolve(&self, lookup: &dyn Fn(&str) -> Option<IpSetHandle>) -> Result<RuleSpec> {
        self.spec.try_map_ipsets(|name| {
            lookup(name).ok_or_else(|| {
                Error::Protocol(format!("rule {} references unknown ipset {name}", self.id))
            })
        })
    }

    pub fn create(
        &mut self,
        dp: &dyn Dataplane,
        lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
    ) -> Result<RuleHandle> {
        let spec = self.resolve(lookup)?;
        let handle = dp.rule_create(&spec)?;
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Replaces this rule with `new`. The installed rule keeps its handle and
    /// is only rewritten when the match changed.
    pub fn update(
        &mut self,
        dp: &dyn Dataplane,
        new: Rule,
        lookup: &dyn Fn(&str) -> Option<IpSetHandle>,
    ) -> Result<RuleHandle> {
        let Some(handle) = self.handle else {
            let mut new = new;
            let handle = new.create(dp, lookup)?;
            *self = new;
            return Ok(handle);
        };
        if new.spec != self.spec {
            dp.rule_update(handle, &new.resolve(lookup)?)?;
            self.spec = new.spec;
        }
        Ok(handle)
    }

    pub fn delete(&mut self, dp: &dyn Dataplane) -> Result<()> {
        if let Some(handle) = self.handle {
            dp.rule_delete(handle)?;
            self.handle = None;
        }
        Ok(())
    }
}

fn parse_protocol(protocol: &proto::Protocol) -> Result<u8> {
    match &protocol.number_or_name {
        Some(proto::protocol::NumberOrName::Number(n)) => u8::try_from(*n)
            .map_err(|_| Error::Protocol(format!("protocol number {n} out of range"))),
        Some(proto::protocol::NumberOrName::Name(name)) => {
            parse_protocol_name(name).map_err(|e| Error::Protocol(e.to_string()))
        }
        None => Err(Error::Protocol("protocol without number or name".into())),
    }
}

fn parse_nets(nets: &[String]) -> Result<Vec<IpNetwork>> {
    nets.iter()
        .map(|n| parse_net(n).ok_or_else(|| Error::Protocol(format!("invalid network {n}"))))
        .collect()
}

fn parse_ports(ports: &[proto::PortRange]) -> Result<Vec<PortRange>> {
    ports
        .iter()
        .map(|p| {
            let first = u16::try_from(p.first);
            let last = u16::try_from(p.last);
            match (first, last) {
                (Ok(first), Ok(last)) if first <= last => Ok(PortRange { first, last }),
                _ => Err(Error::Protocol(format!(
                    "invalid port range {}-{}",
                    p.first, p.last
                ))),
            }
        })
        .collect()
}

fn content_key(spec: &RuleSpec<String>) -> String {
    let mut hasher = DefaultHasher::new();
    spec.hash(&mut hasher);
    format!("anon-{:016x}", hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::{MemoryDataplane, Op};

    fn proto_rule(id: &str, dst_port: i32) -> proto::Rule {
        proto::Rule {
            action: "Allow".into(),
            protocol: Some(proto::Protocol {
                number_or_name: Some(proto::protocol::NumberOrName::Name("TCP".into())),
            }),
            dst_ports: vec![proto::PortRange {
                first: dst_port,
                last: dst_port,
            }],
            src_ip_set_ids: vec!["s1".into()],
            rule_id: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_proto() {
        let rule = Rule::from_proto(&proto_rule("r1", 443)).unwrap();
        assert_eq!(rule.id, "r1");
        assert_eq!(rule.spec.protocol, Some(6));
        assert_eq!(rule.spec.dst_ports, vec![PortRange::single(443)]);
        assert!(rule.handle().is_none());

        let anon = Rule::from_proto(&proto_rule("", 443)).unwrap();
        let again = Rule::from_proto(&proto_rule("", 443)).unwrap();
        assert!(anon.id.starts_with("anon-"));
        assert_eq!(anon.id, again.id);

        let mut bad = proto_rule("r2", 80);
        bad.dst_ports[0].first = 90;
        assert!(Rule::from_proto(&bad).is_err());
        bad = proto_rule("r3", 70000);
        assert!(Rule::from_proto(&bad).is_err());
    }

    #[test]
    fn test_unknown_ipset_is_error() {
        let dp = MemoryDataplane::new();
        let mut rule = Rule::from_proto(&proto_rule("r1", 80)).unwrap();
        assert!(rule.create(&dp, &|_| None).is_err());
        assert_eq!(dp.count(Op::RuleCreate), 0);
    }

    #[test]
    fn test_update_keeps_handle() {
        let dp = MemoryDataplane::new();
        let set = dp.ipset_create(Default::default()).unwrap();
        let lookup = move |name: &str| (name == "s1").then_some(set);

        let mut rule = Rule::from_proto(&proto_rule("r1", 80)).unwrap();
        let handle = rule.create(&dp, &lookup).unwrap();

        let same = Rule::from_proto(&proto_rule("r1", 80)).unwrap();
        assert_eq!(rule.update(&dp, same, &lookup).unwrap(), handle);
        assert_eq!(dp.count(Op::RuleUpdate), 0);

        let changed = Rule::from_proto(&proto_rule("r1", 8080)).unwrap();
        assert_eq!(rule.update(&dp, changed, &lookup).unwrap(), handle);
        assert_eq!(dp.count(Op::RuleUpdate), 1);
        assert_eq!(
            dp.rule(handle).unwrap().dst_ports,
            vec![PortRange::single(8080)]
        );
    }
}
