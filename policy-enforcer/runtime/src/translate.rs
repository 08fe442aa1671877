//! Translates policies into the desired `filter` table.
//!
//! The table is built in stages: the static base ruleset first, then the chains of every policy
//! tuple. The chain reconciler later merges in the deletions needed to converge with the live
//! table.

use crate::{
    core::{
        block,
        blueprint::{self, BlueprintKey, Stage},
        names, policy, Block, Endpoint, InvalidRule, Policy, Scheme, Tuple,
    },
    iptables::{IpRule, IpTable, IpTables, RuleState},
};
use tracing::{debug, trace};

pub const FILTER_TABLE: &str = "filter";

/// The built-in chain that hooks traffic into the managed chains.
pub const FORWARD_CHAIN: &str = "FORWARD";

#[derive(Clone, Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("policy {policy}: no blueprint for {key}")]
    NoBlueprint { policy: String, key: BlueprintKey },

    #[error("policy {policy}: {source}")]
    InvalidRule {
        policy: String,
        #[source]
        source: InvalidRule,
    },
}

#[derive(Clone, Debug)]
pub struct Rendered {
    pub iptables: IpTables,

    /// The number of policy tuples that were translated.
    pub rules: usize,

    /// Tuples that could not be translated. Each is skipped without affecting the others.
    pub errors: Vec<TranslateError>,
}

/// Renders the desired `filter` table.
///
/// Only targets with blocks on `hostname` produce rules.
pub fn render(policies: &[Policy], blocks: &[Block], hostname: &str, scheme: Scheme) -> Rendered {
    let local = block::local(blocks, hostname).collect::<Vec<_>>();

    let mut iptables = IpTables::default();
    make_base(&mut iptables);
    let (rules, errors) = make_policies(&mut iptables, policies, scheme, |target| {
        target_valid(target, &local)
    });

    Rendered {
        iptables,
        rules,
        errors,
    }
}

/// Adds the chains that don't depend on any policy or block.
pub fn make_base(iptables: &mut IpTables) {
    let filter = iptables.ensure_table(FILTER_TABLE);

    filter.ensure_chain(names::INGRESS_CHAIN);
    filter.ensure_chain(names::EGRESS_CHAIN);

    for (chain, hub) in [
        (names::FORWARD_IN_CHAIN, names::INGRESS_CHAIN),
        (names::FORWARD_OUT_CHAIN, names::EGRESS_CHAIN),
    ] {
        let chain = filter.ensure_chain(chain);
        chain.push(IpRule::jump(
            "-m conntrack --ctstate RELATED,ESTABLISHED",
            "ACCEPT",
        ));
        chain.push(IpRule::jump("", hub));
        chain.push(IpRule::jump("", "DROP"));
    }

    let forward = filter.ensure_foreign_chain(FORWARD_CHAIN);
    for (side, hub) in [
        ("dst", names::FORWARD_IN_CHAIN),
        ("src", names::FORWARD_OUT_CHAIN),
    ] {
        let matches = format!("-m set --match-set {} {side}", names::LOCAL_BLOCKS_SET);
        forward.push(IpRule::jump(&matches, hub).with_state(RuleState::Insert));
    }
}

/// Translates every tuple whose target is `valid`.
///
/// Returns the number of translated tuples and the errors of those that could not be translated.
pub fn make_policies(
    iptables: &mut IpTables,
    policies: &[Policy],
    scheme: Scheme,
    valid: impl Fn(&Endpoint) -> bool,
) -> (usize, Vec<TranslateError>) {
    let filter = iptables.ensure_table(FILTER_TABLE);

    let mut rules = 0;
    let mut errors = Vec::new();
    for tuple in policy::tuples(policies) {
        if !valid(tuple.target) {
            debug!(policy = %tuple.policy.id, target = %tuple.target, "Target is invalid for this host");
            continue;
        }
        match translate(filter, &tuple, scheme) {
            Ok(()) => rules += 1,
            Err(error) => errors.push(error),
        }
    }
    (rules, errors)
}

/// Adds the rules of a single tuple to `filter`.
pub fn translate(
    filter: &mut IpTable,
    tuple: &Tuple<'_>,
    scheme: Scheme,
) -> Result<(), TranslateError> {
    let key = BlueprintKey::for_tuple(tuple, scheme);
    let bp = blueprint::lookup(&key).ok_or_else(|| TranslateError::NoBlueprint {
        policy: tuple.policy.id.clone(),
        key,
    })?;
    // Nothing is emitted for a tuple whose rule can't be rendered.
    let terminal = &bp.fourth;
    let l4 = (terminal.rule_matches)(tuple.rule).map_err(|source| TranslateError::InvalidRule {
        policy: tuple.policy.id.clone(),
        source,
    })?;

    ensure_stage(filter, &bp.top, tuple);

    if let Some(second) = &bp.second {
        let chain = (second.chain)(tuple);
        let rule_match = (second.rule_match)(tuple);
        let action = (second.action)(tuple);
        if !chain.is_empty() && !rule_match.is_empty() && !action.is_empty() {
            ensure_rules(filter, &chain, [IpRule::jump(&rule_match, action)]);
        }
    }

    ensure_stage(filter, &bp.third, tuple);

    let rules = l4.into_iter().map(|m| IpRule::jump(&m, terminal.action));
    ensure_rules(filter, &(terminal.chain)(tuple), rules);

    Ok(())
}

fn ensure_stage(filter: &mut IpTable, stage: &Stage, tuple: &Tuple<'_>) {
    let rule = IpRule::jump(&(stage.rule_match)(tuple), (stage.action)(tuple));
    ensure_rules(filter, &(stage.chain)(tuple), [rule]);
}

/// Adds each rule to the named chain unless an identical rule is present, creating the chain if
/// necessary.
pub fn ensure_rules(filter: &mut IpTable, chain: &str, rules: impl IntoIterator<Item = IpRule>) {
    let chain = filter.ensure_chain(chain);
    for rule in rules {
        let body = rule.to_string();
        if chain.insert_normal(rule) {
            trace!(chain = %chain.name, rule = %body, "Added rule");
        }
    }
}

/// Checks whether a target refers to a tenant and segment known from `local_blocks`.
///
/// Targets without a tenant are always valid.
pub fn target_valid(target: &Endpoint, local_blocks: &[&Block]) -> bool {
    let Some(tenant) = target.tenant() else {
        return true;
    };

    let mut segments = local_blocks
        .iter()
        .filter(|b| b.tenant == tenant)
        .map(|b| b.segment.as_str())
        .peekable();
    if segments.peek().is_none() {
        return false;
    }

    match target.segment() {
        None => true,
        Some(segment) => segments.any(|s| s == segment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, Rule, RuleGroup};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn tenant(t: &str, s: Option<&str>) -> Endpoint {
        Endpoint {
            tenant: Some(t.into()),
            segment: s.map(Into::into),
            ..Default::default()
        }
    }

    fn tcp(port: u16) -> Rule {
        Rule {
            protocol: "tcp".into(),
            ports: vec![port],
            ..Default::default()
        }
    }

    fn policy(id: &str, target: Endpoint, peers: Vec<Endpoint>, rules: Vec<Rule>) -> Policy {
        Policy {
            id: id.into(),
            direction: Direction::Ingress,
            applied_to: vec![target],
            rule_groups: vec![RuleGroup { peers, rules }],
        }
    }

    fn block(tenant: &str, segment: &str) -> Block {
        Block {
            cidr: "10.1.0.0/24".parse().unwrap(),
            tenant: tenant.into(),
            segment: segment.into(),
            host: "h1".into(),
        }
    }

    #[rstest]
    #[case::no_tenant(Endpoint { any: true, ..Default::default() }, vec![], true)]
    #[case::unknown_tenant(tenant("T1", None), vec![block("T2", "S1")], false)]
    #[case::known_tenant(tenant("T1", None), vec![block("T1", "S1")], true)]
    #[case::empty_segment(tenant("T1", Some("")), vec![block("T1", "S1")], true)]
    #[case::known_segment(tenant("T1", Some("S1")), vec![block("T1", "S2"), block("T1", "S1")], true)]
    #[case::unknown_segment(tenant("T1", Some("S3")), vec![block("T1", "S1"), block("T2", "S3")], false)]
    #[case::no_blocks(tenant("T1", Some("S1")), vec![], false)]
    fn target_validity(#[case] target: Endpoint, #[case] blocks: Vec<Block>, #[case] valid: bool) {
        let local = blocks.iter().collect::<Vec<_>>();
        assert_eq!(target_valid(&target, &local), valid);
    }

    #[test]
    fn base_ruleset() {
        let mut iptables = IpTables::default();
        make_base(&mut iptables);
        assert_eq!(
            iptables.render(),
            "\
*filter
:ROMANA-INGRESS - [0:0]
:ROMANA-EGRESS - [0:0]
:ROMANA-FORWARD-IN - [0:0]
:ROMANA-FORWARD-OUT - [0:0]
-A ROMANA-FORWARD-IN -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
-A ROMANA-FORWARD-IN -j ROMANA-INGRESS
-A ROMANA-FORWARD-IN -j DROP
-A ROMANA-FORWARD-OUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
-A ROMANA-FORWARD-OUT -j ROMANA-EGRESS
-A ROMANA-FORWARD-OUT -j DROP
-I FORWARD -m set --match-set ROMANA-LOCAL-BLOCKS src -j ROMANA-FORWARD-OUT
-I FORWARD -m set --match-set ROMANA-LOCAL-BLOCKS dst -j ROMANA-FORWARD-IN
COMMIT
"
        );
    }

    #[test]
    fn translation_is_idempotent() {
        let p = policy(
            "P1",
            tenant("T1", None),
            vec![Endpoint {
                cidr: Some("10.0.0.0/24".into()),
                ..Default::default()
            }],
            vec![tcp(80), tcp(443)],
        );

        let mut iptables = IpTables::default();
        make_base(&mut iptables);
        let filter = iptables.ensure_table(FILTER_TABLE);
        for tuple in p.tuples() {
            translate(filter, &tuple, Scheme::PolicyOnTop).unwrap();
        }
        let once = iptables.render();

        let filter = iptables.ensure_table(FILTER_TABLE);
        for tuple in p.tuples() {
            translate(filter, &tuple, Scheme::PolicyOnTop).unwrap();
        }
        assert_eq!(iptables.render(), once);

        let filter = iptables.table(FILTER_TABLE).unwrap();
        assert_eq!(filter.chain(names::INGRESS_CHAIN).unwrap().rules.len(), 1);
        assert_eq!(filter.chain(&names::policy_chain("P1")).unwrap().rules.len(), 1);
        assert_eq!(
            filter
                .chain(&names::rule_group_chain("P1", 0))
                .unwrap()
                .rules
                .len(),
            2
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let any = Endpoint {
            any: true,
            ..Default::default()
        };
        let p1 = policy("P1", tenant("T1", None), vec![any.clone()], vec![tcp(80)]);
        let p2 = policy("P2", tenant("T1", Some("S1")), vec![tenant("T2", None)], vec![tcp(22)]);
        let blocks = vec![block("T1", "S1")];

        for scheme in [Scheme::PolicyOnTop, Scheme::TargetOnTop] {
            let a = render(&[p1.clone(), p2.clone()], &blocks, "h1", scheme);
            let b = render(&[p2.clone(), p1.clone()], &blocks, "h1", scheme);
            assert_eq!(a.iptables.render(), b.iptables.render());
            assert_eq!(a.rules, 2);
        }
    }

    #[test]
    fn untranslatable_tuples_are_skipped() {
        let bad_peer = Endpoint {
            segment: Some("S1".into()),
            ..Default::default()
        };
        let p = policy(
            "P1",
            tenant("T1", None),
            vec![bad_peer, tenant("T2", None)],
            vec![tcp(80)],
        );

        let rendered = render(&[p], &[block("T1", "S1")], "h1", Scheme::PolicyOnTop);
        assert_eq!(rendered.rules, 1);
        assert_eq!(rendered.errors.len(), 1);
        match &rendered.errors[0] {
            TranslateError::NoBlueprint { policy, key } => {
                assert_eq!(policy, "P1");
                assert_eq!(key.peer, crate::core::EndpointKind::Unsupported);
            }
            error => panic!("unexpected error: {error}"),
        }
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let bogus = Rule {
            protocol: "tcp ! -s 1.2.3.4".into(),
            ..Default::default()
        };
        let good = policy("P1", tenant("T1", None), vec![tenant("T2", None)], vec![tcp(80)]);
        let bad = policy("P2", tenant("T1", None), vec![tenant("T2", None)], vec![bogus]);

        let rendered = render(&[good, bad], &[block("T1", "S1")], "h1", Scheme::PolicyOnTop);
        assert_eq!(rendered.rules, 1);
        assert!(matches!(
            &rendered.errors[..],
            [TranslateError::InvalidRule { policy, source: InvalidRule::UnknownProtocol(_) }]
                if policy == "P2"
        ));

        let filter = rendered.iptables.table(FILTER_TABLE).unwrap();
        assert!(filter.chain(&names::policy_chain("P2")).is_none());
        assert!(filter.chain(&names::rule_group_chain("P2", 0)).is_none());
        assert_eq!(
            filter.chain(names::INGRESS_CHAIN).unwrap().targets().collect::<Vec<_>>(),
            vec![names::policy_chain("P1").as_str()]
        );
        assert!(!rendered.iptables.render().contains("1.2.3.4"));
    }

    #[test]
    fn remote_targets_produce_no_rules() {
        let p = policy("P1", tenant("T1", None), vec![tenant("T2", None)], vec![tcp(80)]);
        let mut remote = block("T1", "S1");
        remote.host = "h2".into();

        let rendered = render(&[p], &[remote], "h1", Scheme::PolicyOnTop);
        assert_eq!(rendered.rules, 0);
        let filter = rendered.iptables.table(FILTER_TABLE).unwrap();
        assert!(filter.chain(&names::policy_chain("P1")).is_none());
        assert!(filter.chain(names::INGRESS_CHAIN).unwrap().rules.is_empty());
    }

    #[test]
    fn target_on_top_adds_target_chain() {
        let target = tenant("T1", Some("S1"));
        let p = policy("P1", target.clone(), vec![tenant("T2", None)], vec![tcp(80)]);

        let rendered = render(&[p], &[block("T1", "S1")], "h1", Scheme::TargetOnTop);
        let filter = rendered.iptables.table(FILTER_TABLE).unwrap();
        let target_chain = names::target_chain(&target, Direction::Ingress);

        let ingress = filter.chain(names::INGRESS_CHAIN).unwrap();
        assert_eq!(ingress.targets().collect::<Vec<_>>(), vec![target_chain.as_str()]);

        let chain = filter.chain(&target_chain).unwrap();
        assert_eq!(
            chain.rules[0].to_string(),
            format!(
                "-m set --match-set {} dst -j {}",
                names::tenant_segment_set("T1", "S1"),
                names::policy_chain("P1")
            )
        );
    }
}
