//! Security group rule composition.
//!
//! Security groups are immutable after creation in this design — changing
//! `tunnel_count` means a new group, never widened rules on an existing one.

/// IP protocol for a security group rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// One ingress rule; egress is always allow-all and isn't modeled per-rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
    pub description: String,
}

/// Inputs needed to compose a bridge security group's rule set.
#[derive(Debug, Clone)]
pub struct SecurityGroupSpec {
    pub base_port: u16,
    pub tunnel_count: u32,
    pub allowed_source_cidr: String,
    pub vpc_cidr: String,
    pub overlay_cidr: String,
    pub deploy_reachability_target: bool,
}

/// Compose the ingress rule set for a bridge security group, per
/// spec.md §4.2. Rules never widen in place; a new `tunnel_count` yields a
/// different rule set, hence a different security group.
pub fn compose_ingress_rules(spec: &SecurityGroupSpec) -> Vec<IngressRule> {
    let mut rules = Vec::new();

    rules.push(IngressRule {
        protocol: Protocol::Udp,
        from_port: spec.base_port,
        to_port: spec.base_port + spec.tunnel_count as u16 - 1,
        cidr: spec.allowed_source_cidr.clone(),
        description: "encrypted tunnel data plane".into(),
    });

    rules.push(IngressRule {
        protocol: Protocol::Tcp,
        from_port: 22,
        to_port: 22,
        cidr: spec.allowed_source_cidr.clone(),
        description: "emergency SSH access".into(),
    });

    rules.push(IngressRule {
        protocol: Protocol::Icmp,
        from_port: 0,
        to_port: 0,
        cidr: spec.vpc_cidr.clone(),
        description: "ICMP from VPC".into(),
    });

    rules.push(IngressRule {
        protocol: Protocol::Icmp,
        from_port: 0,
        to_port: 0,
        cidr: spec.overlay_cidr.clone(),
        description: "ICMP from overlay".into(),
    });

    if spec.deploy_reachability_target {
        rules.push(IngressRule {
            protocol: Protocol::Tcp,
            from_port: 8080,
            to_port: 8080,
            cidr: spec.overlay_cidr.clone(),
            description: "reachability target health check".into(),
        });
    }

    rules
}

/// Human-readable summary of a rule set, used by `--list-vpcs`/`status`
/// style reporting and test fixtures.
pub fn describe_rules(rules: &[IngressRule]) -> String {
    rules
        .iter()
        .map(|r| {
            format!(
                "{}/{}-{} from {} ({})",
                r.protocol.as_str(),
                r.from_port,
                r.to_port,
                r.cidr,
                r.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(tunnel_count: u32, target: bool) -> SecurityGroupSpec {
        SecurityGroupSpec {
            base_port: 51820,
            tunnel_count,
            allowed_source_cidr: "203.0.113.0/24".into(),
            vpc_cidr: "10.100.0.0/16".into(),
            overlay_cidr: "10.200.0.0/16".into(),
            deploy_reachability_target: target,
        }
    }

    #[test]
    fn udp_range_is_contiguous_and_sized_by_tunnel_count() {
        let rules = compose_ingress_rules(&spec(4, false));
        let udp = rules.iter().find(|r| r.protocol == Protocol::Udp).unwrap();
        assert_eq!(udp.from_port, 51820);
        assert_eq!(udp.to_port, 51823);
    }

    #[test]
    fn target_rule_only_present_when_deployed() {
        let without = compose_ingress_rules(&spec(2, false));
        let with = compose_ingress_rules(&spec(2, true));
        assert!(!without.iter().any(|r| r.to_port == 8080));
        assert!(with.iter().any(|r| r.to_port == 8080));
    }

    #[test]
    fn changing_tunnel_count_changes_the_rule_set() {
        let a = compose_ingress_rules(&spec(2, false));
        let b = compose_ingress_rules(&spec(3, false));
        assert_ne!(a, b, "a new tunnel count must produce a distinct rule set");
    }
}
