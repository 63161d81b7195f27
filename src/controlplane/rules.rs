//! Desired security group rules of a LoadBalancer

use crate::crd::LoadBalancer;
use crate::domain::{EtherType, RuleDirection, RuleSpec};
use ipnet::IpNet;
use std::str::FromStr;

const VRRP_PROTOCOL: &str = "112";
const SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRules {
    /// Sorted, without duplicates
    pub rules: Vec<RuleSpec>,
    /// Source ranges that could not be parsed and were skipped
    pub invalid_source_ranges: Vec<String>,
}

/// Address family and network address of a CIDR, with host bits cleared the
/// way Neutron stores it. `None` if it does not parse.
pub fn source_prefix(cidr: &str) -> Option<(EtherType, String)> {
    let net = IpNet::from_str(cidr.trim()).ok()?;
    let family = match net {
        IpNet::V4(_) => EtherType::IPv4,
        IpNet::V6(_) => EtherType::IPv6,
    };
    Some((family, net.trunc().to_string()))
}

/// Rules the security group `security_group_id` of `lb` has to contain
pub fn desired_rules(lb: &LoadBalancer, security_group_id: &str) -> DesiredRules {
    let mut desired = DesiredRules::default();
    let mut sources: Vec<(EtherType, String)> = Vec::new();

    for range in &lb.spec.options.load_balancer_source_ranges {
        match source_prefix(range) {
            Some(source) => sources.push(source),
            None => desired.invalid_source_ranges.push(range.clone()),
        }
    }
    if lb.spec.options.load_balancer_source_ranges.is_empty() {
        for family in [EtherType::IPv4, EtherType::IPv6] {
            sources.push((family, family.any_prefix().to_string()));
        }
    }

    for family in [EtherType::IPv4, EtherType::IPv6] {
        desired.rules.push(RuleSpec::any(RuleDirection::Egress, family));
        desired.rules.push(RuleSpec {
            protocol: Some(VRRP_PROTOCOL.to_string()),
            remote_group_id: Some(security_group_id.to_string()),
            ..RuleSpec::any(RuleDirection::Ingress, family)
        });

        if lb.spec.debug_settings.enabled {
            desired.rules.push(port_rule(family, "tcp", SSH_PORT, family.any_prefix()));
        }
    }

    for (family, prefix) in &sources {
        let icmp = match family {
            EtherType::IPv4 => "icmp",
            EtherType::IPv6 => "ipv6-icmp",
        };
        desired.rules.push(RuleSpec {
            protocol: Some(icmp.to_string()),
            remote_ip_prefix: Some(prefix.clone()),
            ..RuleSpec::any(RuleDirection::Ingress, *family)
        });

        for port in &lb.spec.ports {
            desired
                .rules
                .push(port_rule(*family, &port.protocol.to_string(), port.port, prefix));
        }
    }

    desired.rules.sort();
    desired.rules.dedup();
    desired
}

fn port_rule(family: EtherType, protocol: &str, port: u16, prefix: &str) -> RuleSpec {
    RuleSpec {
        protocol: Some(protocol.to_lowercase()),
        port_range_min: Some(port),
        port_range_max: Some(port),
        remote_ip_prefix: Some(prefix.to_string()),
        ..RuleSpec::any(RuleDirection::Ingress, family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::load_balancer::fixtures;
    use crate::crd::{LoadBalancerPort, PortProtocol};

    #[test]
    fn test_source_prefix() {
        assert_eq!(source_prefix("10.0.0.0/8"), Some((EtherType::IPv4, "10.0.0.0/8".to_string())));
        assert_eq!(
            source_prefix("2001:db8::/32"),
            Some((EtherType::IPv6, "2001:db8::/32".to_string()))
        );
        assert_eq!(source_prefix("10.0.0.0/33"), None);
        assert_eq!(source_prefix("10.0.0.0"), None);
        assert_eq!(source_prefix("not-a-cidr/8"), None);
    }

    #[test]
    fn test_source_prefix_clears_host_bits() {
        assert_eq!(source_prefix("10.0.0.1/8"), Some((EtherType::IPv4, "10.0.0.0/8".to_string())));
        assert_eq!(
            source_prefix("2001:db8::1/64"),
            Some((EtherType::IPv6, "2001:db8::/64".to_string()))
        );

        let mut lb = fixtures::load_balancer("default", "web");
        lb.spec.options.load_balancer_source_ranges = vec!["10.0.0.1/8".into(), "10.0.0.0/8".into()];
        let desired = desired_rules(&lb, "sg-1");
        assert!(desired.rules.contains(&port_rule(EtherType::IPv4, "tcp", 80, "10.0.0.0/8")));
        assert!(!desired
            .rules
            .iter()
            .any(|r| r.remote_ip_prefix.as_deref() == Some("10.0.0.1/8")));
        // both ranges name the same network: egress, vrrp, icmp, tcp/80 for v4
        let v4 = desired.rules.iter().filter(|r| r.ether_type == EtherType::IPv4).count();
        assert_eq!(v4, 4);
    }

    #[test]
    fn test_default_rules_open_ports_to_everyone() {
        let lb = fixtures::load_balancer("default", "web");
        let desired = desired_rules(&lb, "sg-1");

        // egress + vrrp + icmp + tcp/80, per family
        assert_eq!(desired.rules.len(), 8);
        assert!(desired.rules.contains(&port_rule(EtherType::IPv4, "tcp", 80, "0.0.0.0/0")));
        assert!(desired.rules.contains(&port_rule(EtherType::IPv6, "tcp", 80, "::/0")));
        assert!(desired
            .rules
            .iter()
            .any(|r| r.remote_group_id.as_deref() == Some("sg-1")));
        assert!(desired.invalid_source_ranges.is_empty());
    }

    #[test]
    fn test_source_ranges_restrict_ingress() {
        let mut lb = fixtures::load_balancer("default", "web");
        lb.spec.options.load_balancer_source_ranges =
            vec!["10.0.0.0/8".into(), "bogus".into()];
        lb.spec.ports.push(LoadBalancerPort {
            name: None,
            protocol: PortProtocol::Udp,
            port: 53,
            node_port: None,
        });
        let desired = desired_rules(&lb, "sg-1");

        assert_eq!(desired.invalid_source_ranges, vec!["bogus".to_string()]);
        assert!(desired.rules.contains(&port_rule(EtherType::IPv4, "udp", 53, "10.0.0.0/8")));
        assert!(!desired
            .rules
            .iter()
            .any(|r| r.remote_ip_prefix.as_deref() == Some("0.0.0.0/0")));
        // no IPv6 source, so only the family-wide egress and vrrp rules remain for v6
        let v6: Vec<_> = desired
            .rules
            .iter()
            .filter(|r| r.ether_type == EtherType::IPv6)
            .collect();
        assert_eq!(v6.len(), 2);
    }

    #[test]
    fn test_debug_opens_ssh() {
        let mut lb = fixtures::load_balancer("default", "web");
        lb.spec.debug_settings.enabled = true;
        let desired = desired_rules(&lb, "sg-1");
        assert!(desired.rules.contains(&port_rule(EtherType::IPv4, "tcp", 22, "0.0.0.0/0")));
    }

    #[test]
    fn test_duplicate_ports_are_collapsed() {
        let mut lb = fixtures::load_balancer("default", "web");
        let dup = lb.spec.ports[0].clone();
        lb.spec.ports.push(dup);
        assert_eq!(desired_rules(&lb, "sg-1").rules.len(), 8);
    }
}
