//! Romana policy enforcer runtime
//!
//! Drives the reconciliation of policies and address blocks into ipsets and iptables chains on
//! the local host.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use romana_policy_enforcer_core as core;
pub use romana_policy_enforcer_ipset as ipset;
pub use romana_policy_enforcer_iptables as iptables;

mod args;
pub mod cleanup;
pub mod enforcer;
pub mod exec;
pub mod metrics;
pub mod netfilter;
pub mod sets;
pub mod source;
pub mod translate;


pub use self::{
    args::Args,
    enforcer::{Config, Enforcer},
    exec::{Exec, Process},
    metrics::EnforcerMetrics,
    netfilter::Netfilter,
    source::{FileSource, PolicyStore},
};
