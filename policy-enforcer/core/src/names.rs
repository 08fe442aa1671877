//! Names of every ipset and iptables chain the enforcer manages.
//!
//! All names are pure functions of their inputs. Identifiers are folded into a short digest so
//! that generated names fit the kernel's limits (28 bytes for a chain, 31 for a set) regardless
//! of how long tenant, segment or policy identifiers are.

use crate::policy::{Direction, Endpoint, Policy};

/// Every managed chain and set carries this prefix. Anything else is never created or removed.
pub const MANAGED_PREFIX: &str = "ROMANA-";

/// Holds the blocks owned by the current host.
pub const LOCAL_BLOCKS_SET: &str = "ROMANA-LOCAL-BLOCKS";

pub const INGRESS_CHAIN: &str = "ROMANA-INGRESS";
pub const EGRESS_CHAIN: &str = "ROMANA-EGRESS";
pub const FORWARD_IN_CHAIN: &str = "ROMANA-FORWARD-IN";
pub const FORWARD_OUT_CHAIN: &str = "ROMANA-FORWARD-OUT";

pub const MAX_CHAIN_NAME_LEN: usize = 28;
pub const MAX_SET_NAME_LEN: usize = 31;

pub fn is_managed(name: &str) -> bool {
    name.starts_with(MANAGED_PREFIX)
}

/// The `list:set` holding every segment set of `tenant`.
pub fn tenant_set(tenant: &str) -> String {
    format!("{MANAGED_PREFIX}T-{}", digest(&[tenant]))
}

/// The `hash:net` set holding every block of a tenant segment.
pub fn tenant_segment_set(tenant: &str, segment: &str) -> String {
    format!(
        "{MANAGED_PREFIX}T-{}-S-{}",
        digest(&[tenant]),
        digest(&[segment])
    )
}

/// The set matching the CIDR peers of a policy.
///
/// Ingress policies match peers as traffic sources; egress policies as destinations.
pub fn policy_set(policy: &Policy) -> String {
    match policy.direction {
        Direction::Ingress => policy_set_src(&policy.id),
        Direction::Egress => policy_set_dst(&policy.id),
    }
}

pub fn policy_set_src(policy_id: &str) -> String {
    format!("{MANAGED_PREFIX}P-{}-SRC", digest(&[policy_id]))
}

pub fn policy_set_dst(policy_id: &str) -> String {
    format!("{MANAGED_PREFIX}P-{}-DST", digest(&[policy_id]))
}

pub fn policy_chain(policy_id: &str) -> String {
    format!("{MANAGED_PREFIX}P-{}", digest(&[policy_id]))
}

/// The chain holding the L4 rules of one rule group.
pub fn rule_group_chain(policy_id: &str, group: usize) -> String {
    format!("{MANAGED_PREFIX}P-{}-R{group}", digest(&[policy_id]))
}

/// The per-target chain used when targets are filtered before policies.
pub fn target_chain(target: &Endpoint, direction: Direction) -> String {
    let suffix = match direction {
        Direction::Ingress => "IN",
        Direction::Egress => "OUT",
    };
    match (target.tenant(), target.segment()) {
        (Some(tenant), Some(segment)) => {
            format!("{MANAGED_PREFIX}T-{}-{suffix}", digest(&[tenant, segment]))
        }
        (Some(tenant), None) => format!("{MANAGED_PREFIX}T-{}-{suffix}", digest(&[tenant])),
        _ => format!("{MANAGED_PREFIX}ANY-{suffix}"),
    }
}

/// A 32-bit FNV-1a digest of the parts, rendered as 8 hex digits.
///
/// Parts are separated by a NUL byte so that `["ab", "c"]` and `["a", "bc"]` differ.
fn digest(parts: &[&str]) -> String {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            // XOR with the NUL separator is a no-op.
            hash = hash.wrapping_mul(PRIME);
        }
        for byte in part.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    format!("{hash:08x}")
}
