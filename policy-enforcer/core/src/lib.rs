//! Romana policy enforcer data model
//!
//! The enforcer renders two independently updated inputs into packet filter state:
//!
//! - The list of [`Policy`] resources, read wholesale from a [`PolicyCache`].
//! - A [`BlocksSnapshot`] describing which tenant, segment and host owns each allocated address
//!   block.
//!
//! This crate holds the types shared by the set builder and the rule translator, the naming
//! scheme for every managed ipset and iptables chain, and the static [`blueprint`] table that
//! describes how a single policy tuple is translated into chains.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod block;
pub mod blueprint;
pub mod names;
pub mod policy;

pub use self::{
    block::{Block, BlocksSnapshot},
    blueprint::{Blueprint, BlueprintKey, InvalidRule, Scheme},
    policy::{Direction, Endpoint, EndpointKind, Policy, Rule, RuleGroup, Tuple},
};
pub use ipnet::{IpNet, Ipv4Net};

/// Provides a consistent snapshot of the policies known to this host.
pub trait PolicyCache {
    fn list(&self) -> Vec<Policy>;
}

impl<C: PolicyCache + ?Sized> PolicyCache for std::sync::Arc<C> {
    fn list(&self) -> Vec<Policy> {
        (**self).list()
    }
}
