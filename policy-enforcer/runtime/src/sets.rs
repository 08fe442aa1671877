//! Builds the desired ipset configuration from policies and blocks.

use crate::{
    core::{block, names, Block, EndpointKind, IpNet, Policy},
    ipset::{Ipset, Member, SetError, SetType},
};
use std::collections::{hash_map::Entry, HashMap};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum SetBuildError {
    #[error("policy {policy} has an invalid peer CIDR {cidr:?}: {source}")]
    InvalidCidr {
        policy: String,
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    /// Blocks without a tenant or segment can't be told apart from the tenant's other blocks.
    #[error("block {cidr} of tenant {tenant:?} has no segment")]
    AmbiguousBlock { cidr: IpNet, tenant: String },

    /// Identifiers are folded into short digests, which may collide.
    #[error("{first:?} and {second:?} would share {name}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Set(#[from] SetError),
}

/// Tracks which identifier each generated name stands for.
#[derive(Debug, Default)]
struct Claims(HashMap<String, String>);

/// Builds the complete set configuration for the given inputs.
///
/// The configuration holds one peer set per policy, a `hash:net` set per tenant segment, a
/// `list:set` per tenant aggregating its segment sets, and a set of the blocks owned by
/// `hostname`.
pub fn build(policies: &[Policy], blocks: &[Block], hostname: &str) -> Result<Ipset, SetBuildError> {
    let mut sets = Ipset::default();
    let mut claims = Claims::default();

    let mut sorted = policies.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for policy in sorted {
        // Policy chains and sets share the digest of the policy id.
        claims.claim(names::policy_chain(&policy.id), &policy.id)?;
        add_policy(&mut sets, policy)?;
    }

    for block in blocks {
        if block.tenant.is_empty() || block.segment.is_empty() {
            return Err(SetBuildError::AmbiguousBlock {
                cidr: block.cidr,
                tenant: block.tenant.clone(),
            });
        }
        trace!(cidr = %block.cidr, tenant = %block.tenant, segment = %block.segment, "Adding block");

        let tenant_set = names::tenant_set(&block.tenant);
        claims.claim(tenant_set.clone(), &block.tenant)?;
        let segment_set = names::tenant_segment_set(&block.tenant, &block.segment);
        claims.claim(
            segment_set.clone(),
            &format!("{}/{}", block.tenant, block.segment),
        )?;
        sets.upsert(&segment_set, SetType::HashNet)?
            .add_net(block.cidr)?;
        sets.upsert(&tenant_set, SetType::ListSet)?
            .add_member(Member::Set(segment_set))?;
    }

    let local = sets.upsert(names::LOCAL_BLOCKS_SET, SetType::HashNet)?;
    for block in block::local(blocks, hostname) {
        local.add_net(block.cidr)?;
    }

    Ok(sets)
}

// === impl Claims ===

impl Claims {
    fn claim(&mut self, name: String, id: &str) -> Result<(), SetBuildError> {
        match self.0.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(id.to_string());
                Ok(())
            }
            Entry::Occupied(entry) if entry.get() == id => Ok(()),
            Entry::Occupied(entry) => Err(SetBuildError::NameCollision {
                first: entry.get().clone(),
                second: id.to_string(),
                name: entry.key().clone(),
            }),
        }
    }
}

/// Adds the set matching a policy's CIDR peers.
///
/// Other peer kinds are matched through tenant sets and don't contribute members.
fn add_policy(sets: &mut Ipset, policy: &Policy) -> Result<(), SetBuildError> {
    let set = sets.upsert(&names::policy_set(policy), SetType::HashNet)?;
    for peer in policy.peers().filter(|p| p.kind() == EndpointKind::Cidr) {
        let cidr = peer.cidr().unwrap_or_default();
        let net = cidr
            .parse::<IpNet>()
            .map_err(|source| SetBuildError::InvalidCidr {
                policy: policy.id.clone(),
                cidr: cidr.to_string(),
                source,
            })?;
        set.add_net(net)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, Endpoint, RuleGroup};
    use pretty_assertions::assert_eq;

    fn block(cidr: &str, tenant: &str, segment: &str, host: &str) -> Block {
        Block {
            cidr: cidr.parse().unwrap(),
            tenant: tenant.into(),
            segment: segment.into(),
            host: host.into(),
        }
    }

    fn policy(id: &str, direction: Direction, peers: Vec<Endpoint>) -> Policy {
        Policy {
            id: id.into(),
            direction,
            applied_to: vec![],
            rule_groups: vec![RuleGroup {
                peers,
                rules: vec![],
            }],
        }
    }

    fn cidr(c: &str) -> Endpoint {
        Endpoint {
            cidr: Some(c.into()),
            ..Default::default()
        }
    }

    #[test]
    fn builds_tenant_segment_and_local_sets() {
        let blocks = vec![
            block("10.1.0.0/24", "T1", "S1", "h1"),
            block("10.1.1.0/24", "T1", "S1", "h2"),
            block("10.1.2.0/24", "T1", "S2", "h2"),
            // Duplicates are suppressed.
            block("10.1.0.0/24", "T1", "S1", "h1"),
        ];
        let sets = build(&[], &blocks, "h1").expect("must build");

        let s1 = sets.get(&names::tenant_segment_set("T1", "S1")).unwrap();
        assert_eq!(s1.set_type(), SetType::HashNet);
        assert_eq!(
            s1.members().iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["10.1.0.0/24", "10.1.1.0/24"]
        );

        let t1 = sets.get(&names::tenant_set("T1")).unwrap();
        assert_eq!(t1.set_type(), SetType::ListSet);
        assert_eq!(
            t1.members(),
            &[
                Member::Set(names::tenant_segment_set("T1", "S1")),
                Member::Set(names::tenant_segment_set("T1", "S2")),
            ]
        );

        let local = sets.get(names::LOCAL_BLOCKS_SET).unwrap();
        assert_eq!(
            local.members().iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["10.1.0.0/24"]
        );
    }

    #[test]
    fn builds_one_set_per_policy_from_cidr_peers() {
        let any = Endpoint {
            any: true,
            ..Default::default()
        };
        let policies = vec![
            policy(
                "P1",
                Direction::Ingress,
                vec![cidr("10.0.0.0/24"), any, cidr("10.0.0.0/24")],
            ),
            policy("P2", Direction::Egress, vec![]),
        ];
        let sets = build(&policies, &[], "h1").expect("must build");

        let src = sets.get(&names::policy_set_src("P1")).unwrap();
        assert_eq!(
            src.members(),
            &[Member::Net("10.0.0.0/24".parse().unwrap())]
        );
        assert!(sets.get(&names::policy_set_dst("P2")).unwrap().members().is_empty());
        // Two policy sets and the local set.
        assert_eq!(sets.len(), 3);
    }

    #[test]
    fn rendering_is_deterministic() {
        let policies = vec![
            policy("P1", Direction::Ingress, vec![cidr("10.0.0.0/24"), cidr("10.0.1.0/24")]),
            policy("P2", Direction::Egress, vec![cidr("192.168.0.0/16")]),
            policy("P3", Direction::Ingress, vec![cidr("10.0.2.0/24")]),
        ];
        let blocks = vec![
            block("10.1.0.0/24", "T1", "S1", "h1"),
            block("10.1.1.0/24", "T1", "S2", "h1"),
            block("10.2.0.0/24", "T2", "S1", "h2"),
        ];

        let a = build(&policies, &blocks, "h1").expect("must build");
        let b = build(&policies, &blocks, "h1").expect("must build");
        assert_eq!(a.render(), b.render());

        let mut reversed = policies.clone();
        reversed.reverse();
        let c = build(&reversed, &blocks, "h1").expect("must build");
        assert_eq!(a.render(), c.render());

        let set_names = |sets: &Ipset| {
            sets.iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(set_names(&a), set_names(&c));
        for name in [
            names::policy_set_src("P1"),
            names::policy_set_dst("P2"),
            names::policy_set_src("P3"),
        ] {
            assert!(c.contains(&name), "missing {name}");
        }
    }

    #[test]
    fn rejects_ambiguous_blocks() {
        let blocks = vec![
            block("10.1.0.0/24", "T1", "S1", "h1"),
            block("10.1.1.0/24", "T1", "", "h1"),
        ];
        match build(&[], &blocks, "h1") {
            Err(SetBuildError::AmbiguousBlock { cidr, tenant }) => {
                assert_eq!(cidr.to_string(), "10.1.1.0/24");
                assert_eq!(tenant, "T1");
            }
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn rejects_colliding_identifiers() {
        // Both fold into the digest 76e83c65.
        let (a, b) = ("tenant-97018", "tenant-180400");
        assert_eq!(names::tenant_set(a), names::tenant_set(b));

        let blocks = vec![
            block("10.1.0.0/24", a, "S1", "h1"),
            block("10.1.1.0/24", b, "S1", "h1"),
        ];
        match build(&[], &blocks, "h1") {
            Err(SetBuildError::NameCollision { name, first, second }) => {
                assert_eq!(name, names::tenant_set(a));
                assert_eq!((first.as_str(), second.as_str()), (a, b));
            }
            res => panic!("unexpected result: {res:?}"),
        }

        let policies = vec![
            policy(a, Direction::Ingress, vec![]),
            policy(b, Direction::Egress, vec![]),
        ];
        assert!(matches!(
            build(&policies, &[], "h1"),
            Err(SetBuildError::NameCollision { .. })
        ));

        // The same tenant in several blocks is not a collision.
        let blocks = vec![
            block("10.1.0.0/24", a, "S1", "h1"),
            block("10.1.1.0/24", a, "S2", "h2"),
        ];
        assert!(build(&[], &blocks, "h1").is_ok());
    }

    #[test]
    fn rejects_malformed_peer_cidrs() {
        let policies = vec![policy("P1", Direction::Ingress, vec![cidr("10.0.0.0/99")])];
        assert!(matches!(
            build(&policies, &[], "h1"),
            Err(SetBuildError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn rejects_ipv6_blocks() {
        let blocks = vec![block("fd00::/64", "T1", "S1", "h1")];
        assert!(matches!(
            build(&[], &blocks, "h1"),
            Err(SetBuildError::Set(SetError::UnsupportedFamily(_)))
        ));
    }
}
