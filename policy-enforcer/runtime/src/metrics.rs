use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct EnforcerMetrics {
    pub(crate) ticks: Counter,
    pub(crate) block_updates: Counter,
    pub(crate) policy_updates: Counter,
    pub(crate) managed_sets: Gauge,
    pub(crate) policy_rules: Gauge,
    errors: Family<ErrorLabels, Counter>,
}

/// The stage of a reconciliation that failed.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ErrorKind {
    MakeSets,
    ApplySets,
    Translate,
    LoadIptables,
    ValidateIptables,
    ApplyIptables,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    kind: &'static str,
}

// === impl EnforcerMetrics ===

impl EnforcerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let ticks = Counter::default();
        reg.register(
            "ticks",
            "Total number of reconciliations started",
            ticks.clone(),
        );

        let block_updates = Counter::default();
        reg.register(
            "block_updates",
            "Total number of ipset configurations applied",
            block_updates.clone(),
        );

        let policy_updates = Counter::default();
        reg.register(
            "policy_updates",
            "Total number of iptables configurations applied",
            policy_updates.clone(),
        );

        let managed_sets = Gauge::default();
        reg.register(
            "managed_sets",
            "Number of ipsets in the last applied configuration",
            managed_sets.clone(),
        );

        let policy_rules = Gauge::default();
        reg.register(
            "policy_rules",
            "Number of policy rules translated in the last reconciliation",
            policy_rules.clone(),
        );

        let errors = Family::default();
        reg.register(
            "errors",
            "Total number of reconciliation failures by stage",
            errors.clone(),
        );

        Self {
            ticks,
            block_updates,
            policy_updates,
            managed_sets,
            policy_rules,
            errors,
        }
    }

    pub(crate) fn error(&self, kind: ErrorKind) {
        self.errors
            .get_or_create(&ErrorLabels {
                kind: kind.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors
            .get_or_create(&ErrorLabels {
                kind: kind.as_str(),
            })
            .get()
    }
}

// === impl ErrorKind ===

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MakeSets => "make_sets",
            Self::ApplySets => "apply_sets",
            Self::Translate => "translate",
            Self::LoadIptables => "load_iptables",
            Self::ValidateIptables => "validate_iptables",
            Self::ApplyIptables => "apply_iptables",
        }
    }
}
