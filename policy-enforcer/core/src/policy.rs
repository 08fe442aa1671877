use serde::{Deserialize, Serialize};
use std::fmt;

/// The side of a connection a policy protects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// An abstract access-control policy.
///
/// Policies are immutable once observed: the enforcer always reads the complete list from the
/// policy cache and never applies partial updates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub direction: Direction,

    /// Endpoints owning this policy.
    #[serde(default)]
    pub applied_to: Vec<Endpoint>,

    #[serde(default)]
    pub rule_groups: Vec<RuleGroup>,
}

/// Admits traffic from (or to) any of `peers` when it matches any of `rules`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleGroup {
    pub peers: Vec<Endpoint>,
    pub rules: Vec<Rule>,
}

/// An endpoint is either the target of a policy or one of its peers.
///
/// Empty strings are treated as if the field were absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub any: bool,
}

/// The shape of an [`Endpoint`], which selects a translation blueprint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Any,
    Cidr,
    Tenant,
    TenantSegment,
    Unsupported,
}

/// An L4 match. Every rule carries the same terminal action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub protocol: String,
    pub ports: Vec<u16>,
    pub port_ranges: Vec<[u16; 2]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<u8>,
}

/// One unit of translation: a single rule of a single peer, applied to a single target.
#[derive(Copy, Clone, Debug)]
pub struct Tuple<'p> {
    pub policy: &'p Policy,

    /// Index of the rule group the peer and rule were taken from.
    pub group: usize,

    pub target: &'p Endpoint,
    pub peer: &'p Endpoint,
    pub rule: &'p Rule,
}

/// Enumerates every (policy, target, peer, rule) combination.
///
/// Policies are visited in identifier order so that the result does not depend on the order in
/// which the cache returned them.
pub fn tuples(policies: &[Policy]) -> impl Iterator<Item = Tuple<'_>> {
    let mut sorted = policies.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted.into_iter().flat_map(|policy| policy.tuples())
}

// === impl Direction ===

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

// === impl Policy ===

impl Policy {
    pub fn tuples(&self) -> impl Iterator<Item = Tuple<'_>> {
        self.applied_to.iter().flat_map(move |target| {
            self.rule_groups
                .iter()
                .enumerate()
                .flat_map(move |(group, rg)| {
                    rg.peers.iter().flat_map(move |peer| {
                        rg.rules.iter().map(move |rule| Tuple {
                            policy: self,
                            group,
                            target,
                            peer,
                            rule,
                        })
                    })
                })
        })
    }

    /// Returns every peer of the policy, across all rule groups.
    pub fn peers(&self) -> impl Iterator<Item = &Endpoint> {
        self.rule_groups.iter().flat_map(|rg| rg.peers.iter())
    }
}

// === impl Endpoint ===

impl Endpoint {
    pub fn tenant(&self) -> Option<&str> {
        non_empty(&self.tenant)
    }

    pub fn segment(&self) -> Option<&str> {
        non_empty(&self.segment)
    }

    pub fn cidr(&self) -> Option<&str> {
        non_empty(&self.cidr)
    }

    pub fn kind(&self) -> EndpointKind {
        match (self.any, self.tenant(), self.segment(), self.cidr()) {
            (true, None, None, None) => EndpointKind::Any,
            (false, None, None, Some(_)) => EndpointKind::Cidr,
            (false, Some(_), Some(_), None) => EndpointKind::TenantSegment,
            (false, Some(_), None, None) => EndpointKind::Tenant,
            _ => EndpointKind::Unsupported,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return f.write_str("any");
        }
        let mut sep = "";
        for (key, value) in [
            ("tenant", self.tenant()),
            ("segment", self.segment()),
            ("cidr", self.cidr()),
        ] {
            if let Some(value) = value {
                write!(f, "{sep}{key}={value}")?;
                sep = ",";
            }
        }
        if sep.is_empty() {
            f.write_str("<empty>")?;
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// === impl EndpointKind ===

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Cidr => f.write_str("cidr"),
            Self::Tenant => f.write_str("tenant"),
            Self::TenantSegment => f.write_str("tenant-segment"),
            Self::Unsupported => f.write_str("unsupported"),
        }
    }
}
