use std::collections::BTreeMap;

use tracing::{debug, error};

use super::AgentState;
use crate::dataplane::{Dataplane, SwIfIndex};
use crate::policy::{HostEndpoint, HostEndpointId};
use crate::{Error, Result};

const ALL_INTERFACES: &str = "*";

/// Pairs every uplink tagged `<uplink_prefix><name>` with the tap tagged
/// `<tap_prefix><name>`.
pub(crate) fn map_uplinks_to_taps(
    dp: &dyn Dataplane,
    uplink_prefix: &str,
    tap_prefix: &str,
) -> Result<BTreeMap<SwIfIndex, SwIfIndex>> {
    let uplinks = dp.search_interfaces_with_tag_prefix(uplink_prefix)?;
    let taps = dp.search_interfaces_with_tag_prefix(tap_prefix)?;
    let mut map = BTreeMap::new();
    for (tag, uplink) in uplinks {
        let name = tag.strip_prefix(uplink_prefix).unwrap_or(&tag);
        let Some(tap) = taps.get(&format!("{tap_prefix}{name}")) else {
            return Err(Error::MissingTap(tag));
        };
        debug!(uplink, tap, %tag, "found uplink");
        map.insert(uplink, *tap);
    }
    Ok(map)
}

impl AgentState {
    /// Fills in the uplinks, taps and tunnels a host endpoint applies to.
    pub(super) fn resolve_host_endpoint(
        &self,
        dp: &dyn Dataplane,
        id: &HostEndpointId,
        hep: &mut HostEndpoint,
    ) -> Result<()> {
        let mut uplinks = vec![];
        match hep.interface_name.as_str() {
            ALL_INTERFACES => uplinks.extend(self.uplink_taps.keys().copied()),
            "" => {
                if !hep.expected_ips.is_empty() {
                    uplinks = dp.search_interfaces_with_addresses(
                        &hep.expected_ips,
                        &self.config.uplink_tag_prefix,
                    )?;
                }
            }
            name => {
                let tag = format!("{}{name}", self.config.uplink_tag_prefix);
                match dp.search_interface_with_tag(&tag)? {
                    Some(uplink) => uplinks.push(uplink),
                    None => error!(%id, interface = name, "cannot find host endpoint interface"),
                }
            }
        }
        let taps: Vec<_> = uplinks
            .iter()
            .filter_map(|uplink| self.uplink_taps.get(uplink).copied())
            .collect();
        if uplinks.is_empty() || taps.is_empty() {
            return Err(Error::NoHostEndpointInterfaces(id.to_string()));
        }
        hep.uplinks = uplinks;
        hep.taps = taps;
        hep.tunnels = self.tunnels.clone();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use policy_agent_api::proto;

    use super::*;
    use crate::dataplane::MemoryDataplane;

    fn dataplane() -> MemoryDataplane {
        let dp = MemoryDataplane::new();
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        dp.add_interface(1, "main-eth0", &[addr]);
        dp.add_interface(2, "host-eth0", &[]);
        dp.add_interface(3, "main-eth1", &[]);
        dp.add_interface(4, "host-eth1", &[]);
        dp
    }

    fn endpoint(name: &str, ips: &[&str]) -> HostEndpoint {
        HostEndpoint::from_proto(&proto::HostEndpoint {
            name: name.into(),
            expected_ipv4_addrs: ips.iter().map(|ip| ip.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
    }

    fn id() -> HostEndpointId {
        HostEndpointId {
            endpoint_id: "node1-eth0".into(),
        }
    }

    #[test]
    fn test_map_uplinks_to_taps() {
        let dp = dataplane();
        let map = map_uplinks_to_taps(&dp, "main-", "host-").unwrap();
        assert_eq!(map, BTreeMap::from([(1, 2), (3, 4)]));

        dp.add_interface(5, "main-eth2", &[]);
        assert!(matches!(
            map_uplinks_to_taps(&dp, "main-", "host-"),
            Err(Error::MissingTap(tag)) if tag == "main-eth2"
        ));
    }

    #[test]
    fn test_resolve_modes() {
        let dp = dataplane();
        let mut state = AgentState::for_test(&dp);
        state.tunnels.insert(20);

        let mut hep = endpoint("eth1", &[]);
        state.resolve_host_endpoint(&dp, &id(), &mut hep).unwrap();
        assert_eq!((hep.uplinks, hep.taps), (vec![3], vec![4]));
        assert!(hep.tunnels.contains(&20));

        let mut hep = endpoint("*", &[]);
        state.resolve_host_endpoint(&dp, &id(), &mut hep).unwrap();
        assert_eq!((hep.uplinks, hep.taps), (vec![1, 3], vec![2, 4]));

        let mut hep = endpoint("", &["192.168.1.10"]);
        state.resolve_host_endpoint(&dp, &id(), &mut hep).unwrap();
        assert_eq!((hep.uplinks, hep.taps), (vec![1], vec![2]));
    }

    #[test]
    fn test_resolve_without_interfaces() {
        let dp = dataplane();
        let state = AgentState::for_test(&dp);
        for mut hep in [
            endpoint("eth9", &[]),
            endpoint("", &[]),
            endpoint("", &["10.9.9.9"]),
        ] {
            assert!(matches!(
                state.resolve_host_endpoint(&dp, &id(), &mut hep),
                Err(Error::NoHostEndpointInterfaces(_))
            ));
        }
    }
}
