//! Static translation table.
//!
//! Every (policy, target, peer, rule) tuple is rendered as a short pipeline of iptables rules:
//!
//! 1. a rule in a base chain selecting the target and jumping towards the policy;
//! 2. optionally, a second target-filtering rule in a per-target chain;
//! 3. a rule in the policy chain selecting the peer and jumping to the rule-group chain;
//! 4. one rule per L4 match in the rule-group chain, with the terminal action.
//!
//! A [`Blueprint`] holds the generators for each of these stages. Blueprints are keyed by
//! direction, [`Scheme`], peer kind and target kind; combinations that are absent from the table
//! can't be translated.

use crate::{
    names,
    policy::{Direction, EndpointKind, Rule, Tuple},
};
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use std::{fmt, str::FromStr};

/// Selects the chain topology used to translate policies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Policy chains hang directly off the base chains.
    #[default]
    PolicyOnTop,

    /// Base chains jump to a per-target chain, which in turn jumps to policy chains.
    TargetOnTop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlueprintKey {
    pub direction: Direction,
    pub scheme: Scheme,
    pub peer: EndpointKind,
    pub target: EndpointKind,
}

/// Produces a chain name, match or action for a tuple. An empty string means "nothing".
pub type Generator = fn(&Tuple<'_>) -> String;

#[derive(Copy, Clone)]
pub struct Stage {
    pub chain: Generator,
    pub rule_match: Generator,
    pub action: Generator,
}

/// The last stage, which may expand to several rules.
#[derive(Copy, Clone)]
pub struct Terminal {
    pub chain: Generator,
    pub rule_matches: fn(&Rule) -> Result<Vec<String>, InvalidRule>,
    pub action: &'static str,
}

#[derive(Copy, Clone)]
pub struct Blueprint {
    pub top: Stage,
    pub second: Option<Stage>,
    pub third: Stage,
    pub fourth: Terminal,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown translation scheme: {0}")]
pub struct UnknownScheme(String);

/// A rule that can't be expressed as iptables matches.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRule {
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error("protocol {0:?} has no ports")]
    NoPorts(String),

    #[error("invalid port range {0}:{1}")]
    PortRange(u16, u16),
}

pub const TERMINAL_ACTION: &str = "ACCEPT";

/// Protocols matched with `-m <protocol> --dport`.
const PORT_PROTOCOLS: [&str; 5] = ["tcp", "udp", "udplite", "sctp", "dccp"];

const PLAIN_PROTOCOLS: [&str; 5] = ["icmp", "esp", "ah", "gre", "igmp"];

const ANY_PROTOCOLS: [&str; 3] = ["", "any", "all"];

const PEER_KINDS: [EndpointKind; 4] = [
    EndpointKind::Any,
    EndpointKind::Cidr,
    EndpointKind::Tenant,
    EndpointKind::TenantSegment,
];

const TARGET_KINDS: [EndpointKind; 3] = [
    EndpointKind::Any,
    EndpointKind::Tenant,
    EndpointKind::TenantSegment,
];

static BLUEPRINTS: Lazy<HashMap<BlueprintKey, Blueprint>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for direction in [Direction::Ingress, Direction::Egress] {
        for scheme in [Scheme::PolicyOnTop, Scheme::TargetOnTop] {
            for peer in PEER_KINDS {
                for target in TARGET_KINDS {
                    let key = BlueprintKey {
                        direction,
                        scheme,
                        peer,
                        target,
                    };
                    if let Some(blueprint) = Blueprint::compose(&key) {
                        table.insert(key, blueprint);
                    }
                }
            }
        }
    }
    table
});

/// Looks up the blueprint for `key`.
pub fn lookup(key: &BlueprintKey) -> Option<&'static Blueprint> {
    BLUEPRINTS.get(key)
}

/// Returns the number of translatable combinations.
pub fn len() -> usize {
    BLUEPRINTS.len()
}

// === impl Scheme ===

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyOnTop => f.write_str("policy-on-top"),
            Self::TargetOnTop => f.write_str("target-on-top"),
        }
    }
}

impl FromStr for Scheme {
    type Err = UnknownScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy-on-top" => Ok(Self::PolicyOnTop),
            "target-on-top" => Ok(Self::TargetOnTop),
            s => Err(UnknownScheme(s.to_string())),
        }
    }
}

// === impl BlueprintKey ===

impl BlueprintKey {
    pub fn for_tuple(tuple: &Tuple<'_>, scheme: Scheme) -> Self {
        Self {
            direction: tuple.policy.direction,
            scheme,
            peer: tuple.peer.kind(),
            target: tuple.target.kind(),
        }
    }
}

impl fmt::Display for BlueprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/peer={}/target={}",
            self.direction, self.scheme, self.peer, self.target
        )
    }
}

// === impl Blueprint ===

impl Blueprint {
    fn compose(key: &BlueprintKey) -> Option<Self> {
        let target_match: Generator = match key.target {
            EndpointKind::Any => local_blocks_match,
            EndpointKind::Tenant => tenant_target_match,
            EndpointKind::TenantSegment => segment_target_match,
            _ => return None,
        };
        let peer_match: Generator = match key.peer {
            EndpointKind::Any => match_all,
            EndpointKind::Cidr => policy_set_match,
            EndpointKind::Tenant => tenant_peer_match,
            EndpointKind::TenantSegment => segment_peer_match,
            EndpointKind::Unsupported => return None,
        };
        let base_chain: Generator = match key.direction {
            Direction::Ingress => ingress_chain,
            Direction::Egress => egress_chain,
        };

        let (top, second) = match key.scheme {
            Scheme::PolicyOnTop => (
                Stage {
                    chain: base_chain,
                    rule_match: target_match,
                    action: policy_chain,
                },
                None,
            ),
            Scheme::TargetOnTop => (
                Stage {
                    chain: base_chain,
                    rule_match: target_match,
                    action: target_chain,
                },
                Some(Stage {
                    chain: target_chain,
                    rule_match: target_match,
                    action: policy_chain,
                }),
            ),
        };

        Some(Self {
            top,
            second,
            third: Stage {
                chain: policy_chain,
                rule_match: peer_match,
                action: rule_group_chain,
            },
            fourth: Terminal {
                chain: rule_group_chain,
                rule_matches: l4_matches,
                action: TERMINAL_ACTION,
            },
        })
    }
}

fn target_side(tuple: &Tuple<'_>) -> &'static str {
    match tuple.policy.direction {
        Direction::Ingress => "dst",
        Direction::Egress => "src",
    }
}

fn peer_side(tuple: &Tuple<'_>) -> &'static str {
    match tuple.policy.direction {
        Direction::Ingress => "src",
        Direction::Egress => "dst",
    }
}

fn set_match(set: &str, side: &str) -> String {
    format!("-m set --match-set {set} {side}")
}

fn match_all(_: &Tuple<'_>) -> String {
    String::new()
}

fn local_blocks_match(tuple: &Tuple<'_>) -> String {
    set_match(names::LOCAL_BLOCKS_SET, target_side(tuple))
}

fn tenant_target_match(tuple: &Tuple<'_>) -> String {
    match tuple.target.tenant() {
        Some(tenant) => set_match(&names::tenant_set(tenant), target_side(tuple)),
        None => String::new(),
    }
}

fn segment_target_match(tuple: &Tuple<'_>) -> String {
    match (tuple.target.tenant(), tuple.target.segment()) {
        (Some(tenant), Some(segment)) => set_match(
            &names::tenant_segment_set(tenant, segment),
            target_side(tuple),
        ),
        _ => String::new(),
    }
}

fn policy_set_match(tuple: &Tuple<'_>) -> String {
    set_match(&names::policy_set(tuple.policy), peer_side(tuple))
}

fn tenant_peer_match(tuple: &Tuple<'_>) -> String {
    match tuple.peer.tenant() {
        Some(tenant) => set_match(&names::tenant_set(tenant), peer_side(tuple)),
        None => String::new(),
    }
}

fn segment_peer_match(tuple: &Tuple<'_>) -> String {
    match (tuple.peer.tenant(), tuple.peer.segment()) {
        (Some(tenant), Some(segment)) => set_match(
            &names::tenant_segment_set(tenant, segment),
            peer_side(tuple),
        ),
        _ => String::new(),
    }
}

fn ingress_chain(_: &Tuple<'_>) -> String {
    names::INGRESS_CHAIN.to_string()
}

fn egress_chain(_: &Tuple<'_>) -> String {
    names::EGRESS_CHAIN.to_string()
}

fn policy_chain(tuple: &Tuple<'_>) -> String {
    names::policy_chain(&tuple.policy.id)
}

fn rule_group_chain(tuple: &Tuple<'_>) -> String {
    names::rule_group_chain(&tuple.policy.id, tuple.group)
}

fn target_chain(tuple: &Tuple<'_>) -> String {
    names::target_chain(tuple.target, tuple.policy.direction)
}

/// Expands an L4 rule into iptables matches, one per port or port range.
///
/// Only well known protocol names and protocol numbers are accepted, and ports only for
/// protocols that have them, so nothing but a valid match reaches the rendered table.
pub fn l4_matches(rule: &Rule) -> Result<Vec<String>, InvalidRule> {
    let protocol = rule.protocol.trim().to_ascii_lowercase();
    let has_ports = !rule.ports.is_empty() || !rule.port_ranges.is_empty();
    let number = protocol.parse::<u8>().ok();

    let with_ports = PORT_PROTOCOLS.contains(&protocol.as_str());
    let known = with_ports
        || number.is_some()
        || ANY_PROTOCOLS.contains(&protocol.as_str())
        || PLAIN_PROTOCOLS.contains(&protocol.as_str());
    if !known {
        return Err(InvalidRule::UnknownProtocol(rule.protocol.clone()));
    }
    if has_ports && !with_ports {
        return Err(InvalidRule::NoPorts(protocol));
    }
    if let Some(&[lo, hi]) = rule.port_ranges.iter().find(|[lo, hi]| lo > hi) {
        return Err(InvalidRule::PortRange(lo, hi));
    }

    if let Some(number) = number {
        return Ok(vec![format!("-p {number}")]);
    }
    let matches = match protocol.as_str() {
        p if ANY_PROTOCOLS.contains(&p) => vec![String::new()],
        "icmp" => match (rule.icmp_type, rule.icmp_code) {
            (Some(ty), Some(code)) => vec![format!("-p icmp -m icmp --icmp-type {ty}/{code}")],
            (Some(ty), None) => vec![format!("-p icmp -m icmp --icmp-type {ty}")],
            (None, _) => vec!["-p icmp".to_string()],
        },
        p if with_ports && !has_ports => vec![format!("-p {p}")],
        p if with_ports => {
            let ports = rule.ports.iter().map(|p| p.to_string());
            let ranges = rule.port_ranges.iter().map(|[lo, hi]| format!("{lo}:{hi}"));
            ports
                .chain(ranges)
                .map(|dport| format!("-p {p} -m {p} --dport {dport}"))
                .collect()
        }
        p => vec![format!("-p {p}")],
    };
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Endpoint, Policy, RuleGroup};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn tenant(t: &str, s: Option<&str>) -> Endpoint {
        Endpoint {
            tenant: Some(t.into()),
            segment: s.map(Into::into),
            ..Default::default()
        }
    }

    fn cidr(c: &str) -> Endpoint {
        Endpoint {
            cidr: Some(c.into()),
            ..Default::default()
        }
    }

    fn policy(direction: Direction, target: Endpoint, peer: Endpoint) -> Policy {
        Policy {
            id: "p1".into(),
            direction,
            applied_to: vec![target],
            rule_groups: vec![RuleGroup {
                peers: vec![peer],
                rules: vec![Rule {
                    protocol: "tcp".into(),
                    ports: vec![80],
                    ..Default::default()
                }],
            }],
        }
    }

    #[test]
    fn table_covers_supported_kinds() {
        assert_eq!(len(), 2 * 2 * PEER_KINDS.len() * TARGET_KINDS.len());
    }

    #[rstest]
    #[case::cidr_target(EndpointKind::Tenant, EndpointKind::Cidr)]
    #[case::unsupported_target(EndpointKind::Tenant, EndpointKind::Unsupported)]
    #[case::unsupported_peer(EndpointKind::Unsupported, EndpointKind::Tenant)]
    fn missing_combinations(#[case] peer: EndpointKind, #[case] target: EndpointKind) {
        let key = BlueprintKey {
            direction: Direction::Ingress,
            scheme: Scheme::PolicyOnTop,
            peer,
            target,
        };
        assert!(lookup(&key).is_none());
    }

    #[test]
    fn policy_on_top_ingress() {
        let p = policy(Direction::Ingress, tenant("t1", None), cidr("10.0.0.0/24"));
        let tuple = p.tuples().next().unwrap();
        let bp = lookup(&BlueprintKey::for_tuple(&tuple, Scheme::PolicyOnTop)).unwrap();

        assert_eq!((bp.top.chain)(&tuple), "ROMANA-INGRESS");
        assert_eq!(
            (bp.top.rule_match)(&tuple),
            format!("-m set --match-set {} dst", names::tenant_set("t1"))
        );
        assert_eq!((bp.top.action)(&tuple), names::policy_chain("p1"));
        assert!(bp.second.is_none());
        assert_eq!((bp.third.chain)(&tuple), names::policy_chain("p1"));
        assert_eq!(
            (bp.third.rule_match)(&tuple),
            format!("-m set --match-set {} src", names::policy_set_src("p1"))
        );
        assert_eq!((bp.third.action)(&tuple), names::rule_group_chain("p1", 0));
        assert_eq!((bp.fourth.chain)(&tuple), names::rule_group_chain("p1", 0));
        assert_eq!(
            (bp.fourth.rule_matches)(tuple.rule).unwrap(),
            vec!["-p tcp -m tcp --dport 80"]
        );
        assert_eq!(bp.fourth.action, "ACCEPT");
    }

    #[test]
    fn target_on_top_egress() {
        let p = policy(
            Direction::Egress,
            tenant("t1", Some("s1")),
            tenant("t2", None),
        );
        let tuple = p.tuples().next().unwrap();
        let bp = lookup(&BlueprintKey::for_tuple(&tuple, Scheme::TargetOnTop)).unwrap();
        let target_chain = names::target_chain(tuple.target, Direction::Egress);

        assert_eq!((bp.top.chain)(&tuple), "ROMANA-EGRESS");
        assert_eq!((bp.top.action)(&tuple), target_chain);
        let second = bp.second.expect("target-on-top has a second stage");
        assert_eq!((second.chain)(&tuple), target_chain);
        assert_eq!(
            (second.rule_match)(&tuple),
            format!(
                "-m set --match-set {} src",
                names::tenant_segment_set("t1", "s1")
            )
        );
        assert_eq!((second.action)(&tuple), names::policy_chain("p1"));
        assert_eq!(
            (bp.third.rule_match)(&tuple),
            format!("-m set --match-set {} dst", names::tenant_set("t2"))
        );
    }

    #[test]
    fn any_peer_matches_everything() {
        let any = Endpoint {
            any: true,
            ..Default::default()
        };
        let p = policy(Direction::Ingress, any.clone(), any);
        let tuple = p.tuples().next().unwrap();
        let bp = lookup(&BlueprintKey::for_tuple(&tuple, Scheme::PolicyOnTop)).unwrap();
        assert_eq!(
            (bp.top.rule_match)(&tuple),
            "-m set --match-set ROMANA-LOCAL-BLOCKS dst"
        );
        assert_eq!((bp.third.rule_match)(&tuple), "");
    }

    #[rstest]
    #[case::any("any", vec![], vec![], None, None, vec![""])]
    #[case::empty("", vec![], vec![], None, None, vec![""])]
    #[case::bare_tcp("TCP", vec![], vec![], None, None, vec!["-p tcp"])]
    #[case::ports(
        "udp",
        vec![53, 5353],
        vec![[1000, 2000]],
        None,
        None,
        vec![
            "-p udp -m udp --dport 53",
            "-p udp -m udp --dport 5353",
            "-p udp -m udp --dport 1000:2000",
        ],
    )]
    #[case::icmp_type("icmp", vec![], vec![], Some(8), None, vec!["-p icmp -m icmp --icmp-type 8"])]
    #[case::icmp_code("icmp", vec![], vec![], Some(3), Some(4), vec!["-p icmp -m icmp --icmp-type 3/4"])]
    #[case::bare_icmp("icmp", vec![], vec![], None, Some(4), vec!["-p icmp"])]
    #[case::other("gre", vec![], vec![], None, None, vec!["-p gre"])]
    #[case::number(" 47 ", vec![], vec![], None, None, vec!["-p 47"])]
    fn l4(
        #[case] protocol: &str,
        #[case] ports: Vec<u16>,
        #[case] port_ranges: Vec<[u16; 2]>,
        #[case] icmp_type: Option<u8>,
        #[case] icmp_code: Option<u8>,
        #[case] expected: Vec<&str>,
    ) {
        let rule = Rule {
            protocol: protocol.into(),
            ports,
            port_ranges,
            icmp_type,
            icmp_code,
        };
        assert_eq!(l4_matches(&rule).unwrap(), expected);
    }

    #[rstest]
    #[case::typo("tpc", vec![], vec![], InvalidRule::UnknownProtocol("tpc".into()))]
    #[case::extra_args(
        "tcp ! -s 1.2.3.4",
        vec![],
        vec![],
        InvalidRule::UnknownProtocol("tcp ! -s 1.2.3.4".into()),
    )]
    #[case::extra_line(
        "tcp\n-A FORWARD -j ACCEPT",
        vec![],
        vec![],
        InvalidRule::UnknownProtocol("tcp\n-A FORWARD -j ACCEPT".into()),
    )]
    #[case::out_of_range("256", vec![], vec![], InvalidRule::UnknownProtocol("256".into()))]
    #[case::icmp_ports("icmp", vec![80], vec![], InvalidRule::NoPorts("icmp".into()))]
    #[case::any_ports("any", vec![], vec![[1, 2]], InvalidRule::NoPorts("any".into()))]
    #[case::number_ports("6", vec![80], vec![], InvalidRule::NoPorts("6".into()))]
    #[case::reversed_range("tcp", vec![], vec![[2000, 1000]], InvalidRule::PortRange(2000, 1000))]
    fn l4_rejects(
        #[case] protocol: &str,
        #[case] ports: Vec<u16>,
        #[case] port_ranges: Vec<[u16; 2]>,
        #[case] expected: InvalidRule,
    ) {
        let rule = Rule {
            protocol: protocol.into(),
            ports,
            port_ranges,
            ..Default::default()
        };
        assert_eq!(l4_matches(&rule), Err(expected));
    }

    #[test]
    fn scheme_round_trips_through_str() {
        for scheme in [Scheme::PolicyOnTop, Scheme::TargetOnTop] {
            assert_eq!(scheme.to_string().parse::<Scheme>().unwrap(), scheme);
        }
        assert!("bogus".parse::<Scheme>().is_err());
    }
}
