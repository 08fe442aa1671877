//! Merges the live `filter` table into the desired one.

use crate::{
    core::names,
    iptables::{ChainState, IpChain, IpTables, RuleState},
    translate::FILTER_TABLE,
};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Schedules the deletion of managed chains that exist in `live` but are not desired.
///
/// Foreign rules that are already present live are not inserted again, and foreign rules that
/// jump to a chain being deleted are removed first so that the deletion can succeed. Returns the
/// names of the chains scheduled for deletion.
pub fn cleanup(desired: &mut IpTables, live: &IpTables) -> Vec<String> {
    let Some(live) = live.table(FILTER_TABLE) else {
        debug!("No live filter table");
        return Vec::new();
    };
    let desired = desired.ensure_table(FILTER_TABLE);

    for chain in desired
        .chains
        .iter_mut()
        .filter(|c| c.render_state == ChainState::Insert)
    {
        if let Some(current) = live.chain(&chain.name) {
            drop_present_inserts(chain, current);
        }
    }

    let orphans = live
        .chains
        .iter()
        .filter(|c| names::is_managed(&c.name) && desired.chain(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect::<Vec<_>>();
    if orphans.is_empty() {
        return orphans;
    }

    for name in &orphans {
        debug!(chain = %name, "Scheduling chain for deletion");
        desired.ensure_chain(name).render_state = ChainState::Delete;
    }

    let orphaned = orphans.iter().map(String::as_str).collect::<HashSet<_>>();
    for current in live.chains.iter().filter(|c| !names::is_managed(&c.name)) {
        for rule in &current.rules {
            let Some(target) = &rule.target else {
                continue;
            };
            if !orphaned.contains(target.chain()) {
                continue;
            }
            trace!(chain = %current.name, %rule, "Removing reference to deleted chain");
            // Each `-D` removes one occurrence, so duplicates are deleted once per copy.
            desired
                .ensure_foreign_chain(&current.name)
                .rules
                .push(rule.clone().with_state(RuleState::Delete));
        }
    }

    orphans
}

/// Drops the insertions tagged on foreign chains. Used when the live table can't be checked for
/// rules that are already present.
pub fn withhold_inserts(desired: &mut IpTables) {
    let Some(filter) = desired.table_mut(FILTER_TABLE) else {
        return;
    };
    for chain in filter
        .chains
        .iter_mut()
        .filter(|c| c.render_state == ChainState::Insert)
    {
        chain.rules.retain(|r| r.render_state != RuleState::Insert);
    }
}

fn drop_present_inserts(chain: &mut IpChain, current: &IpChain) {
    chain
        .rules
        .retain(|r| r.render_state != RuleState::Insert || !current.contains(r));
}
