//! An in-memory model of iptables tables.
//!
//! The model is rendered in the `iptables-restore` format and intended to be applied with
//! `--noflush`: chains that are declared with a header are flushed and rewritten, while rules
//! tagged for insertion or deletion are applied to chains that are otherwise left alone. The
//! parser accepts `iptables-save` output so that the live state can be compared with the desired
//! one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::{fmt, str::FromStr};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpTables {
    pub tables: Vec<IpTable>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpTable {
    pub name: String,
    pub chains: Vec<IpChain>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpChain {
    pub name: String,

    /// The default policy of a built-in chain, or `-` for user-defined chains.
    pub policy: String,

    pub rules: Vec<IpRule>,
    pub render_state: ChainState,
}

/// How a chain is rendered.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChainState {
    /// The chain is owned: it is declared (and so flushed) and all of its rules are appended.
    #[default]
    Keep,

    /// The chain is foreign: it is not declared and only its tagged rules are rendered.
    Insert,

    /// The chain is declared to flush it and then deleted.
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpRule {
    /// Whitespace-normalized match expressions. Empty when the rule matches everything.
    pub matches: String,
    pub target: Option<Target>,
    pub render_state: RuleState,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RuleState {
    #[default]
    Append,
    Insert,
    Delete,
}

/// A rule's target, including any target options.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Jump(String),
    Goto(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: ParseErrorKind,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("{0} outside of a table")]
    OutsideTable(&'static str),

    #[error("table {0} is not committed")]
    Uncommitted(String),

    #[error("malformed chain declaration")]
    MalformedChain,

    #[error("rule references undeclared chain {0}")]
    UnknownChain(String),

    #[error("rule has an empty target")]
    EmptyTarget,

    #[error("unsupported line: {0}")]
    Unsupported(String),
}

/// Targets that end a chain's evaluation unconditionally when used without matches.
const CATCH_ALL_TARGETS: [&str; 3] = ["DROP", "REJECT", "RETURN"];

// === impl IpTables ===

impl IpTables {
    pub fn table(&self, name: &str) -> Option<&IpTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut IpTable> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Returns the named table, adding an empty one if it does not exist.
    pub fn ensure_table(&mut self, name: &str) -> &mut IpTable {
        let idx = match self.tables.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                self.tables.push(IpTable::new(name));
                self.tables.len() - 1
            }
        };
        &mut self.tables[idx]
    }

    /// Renders every table in the `iptables-restore` format.
    pub fn render(&self) -> String {
        self.tables.iter().map(IpTable::render).collect()
    }
}

impl fmt::Display for IpTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for IpTables {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tables = IpTables::default();
        let mut current: Option<IpTable> = None;

        for (idx, line) in s.lines().enumerate() {
            let err = |reason| ParseError {
                line: idx + 1,
                reason,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('*') {
                if let Some(table) = current.take() {
                    return Err(err(ParseErrorKind::Uncommitted(table.name)));
                }
                current = Some(IpTable::new(name.trim()));
                continue;
            }

            if line == "COMMIT" {
                let table = current
                    .take()
                    .ok_or_else(|| err(ParseErrorKind::OutsideTable("COMMIT")))?;
                tables.tables.push(table);
                continue;
            }

            if let Some(decl) = line.strip_prefix(':') {
                let table = current
                    .as_mut()
                    .ok_or_else(|| err(ParseErrorKind::OutsideTable("chain")))?;
                let mut parts = decl.split_whitespace();
                let (name, policy) = match (parts.next(), parts.next()) {
                    (Some(name), Some(policy)) => (name, policy),
                    _ => return Err(err(ParseErrorKind::MalformedChain)),
                };
                let chain = table.ensure_chain(name);
                chain.policy = policy.to_string();
                continue;
            }

            if let Some(rest) = line.strip_prefix("-A ") {
                let table = current
                    .as_mut()
                    .ok_or_else(|| err(ParseErrorKind::OutsideTable("rule")))?;
                let rest = rest.trim_start();
                let (name, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let rule = IpRule::parse(body).map_err(err)?;
                let chain = table
                    .chain_mut(name)
                    .ok_or_else(|| err(ParseErrorKind::UnknownChain(name.to_string())))?;
                chain.rules.push(rule);
                continue;
            }

            return Err(err(ParseErrorKind::Unsupported(line.to_string())));
        }

        if let Some(table) = current {
            return Err(ParseError {
                line: s.lines().count(),
                reason: ParseErrorKind::Uncommitted(table.name),
            });
        }

        Ok(tables)
    }
}

// === impl IpTable ===

impl IpTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chains: Vec::new(),
        }
    }

    pub fn chain(&self, name: &str) -> Option<&IpChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut IpChain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    /// Returns the named owned chain, declaring it if necessary.
    pub fn ensure_chain(&mut self, name: &str) -> &mut IpChain {
        self.ensure(name, ChainState::Keep)
    }

    /// Returns the named foreign chain, declaring it if necessary.
    ///
    /// Only rules tagged for insertion or deletion are rendered for foreign chains.
    pub fn ensure_foreign_chain(&mut self, name: &str) -> &mut IpChain {
        self.ensure(name, ChainState::Insert)
    }

    fn ensure(&mut self, name: &str, render_state: ChainState) -> &mut IpChain {
        let idx = match self.chains.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.chains.push(IpChain {
                    name: name.to_string(),
                    policy: "-".to_string(),
                    rules: Vec::new(),
                    render_state,
                });
                self.chains.len() - 1
            }
        };
        &mut self.chains[idx]
    }

    pub fn render(&self) -> String {
        let mut out = format!("*{}\n", self.name);

        for chain in &self.chains {
            if chain.render_state != ChainState::Insert {
                out.push_str(&format!(":{} {} [0:0]\n", chain.name, chain.policy));
            }
        }

        for chain in &self.chains {
            if chain.render_state == ChainState::Delete {
                continue;
            }
            chain.render_rules(&mut out);
        }

        for chain in &self.chains {
            if chain.render_state == ChainState::Delete {
                out.push_str(&format!("-X {}\n", chain.name));
            }
        }

        out.push_str("COMMIT\n");
        out
    }
}

// === impl IpChain ===

impl IpChain {
    pub fn contains(&self, rule: &IpRule) -> bool {
        self.rules.iter().any(|r| r.same_body(rule))
    }

    /// Appends `rule` unless an identical rule is already present.
    ///
    /// Returns true if the rule was added.
    pub fn push(&mut self, rule: IpRule) -> bool {
        if self.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// Adds `rule` above any trailing catch-all `DROP`, `REJECT` or `RETURN` rules so that it can
    /// still take effect. Does nothing if an identical rule is already present.
    ///
    /// Returns true if the rule was added.
    pub fn insert_normal(&mut self, rule: IpRule) -> bool {
        if self.contains(&rule) {
            return false;
        }
        let at = self
            .rules
            .iter()
            .rposition(|r| !r.is_catch_all())
            .map_or(0, |idx| idx + 1);
        self.rules.insert(at, rule);
        true
    }

    /// Iterates over the chains targeted by this chain's rules.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter_map(|r| r.target.as_ref().map(Target::chain))
    }

    fn render_rules(&self, out: &mut String) {
        let tagged = |state| self.rules.iter().filter(move |r| r.render_state == state);

        for rule in tagged(RuleState::Delete) {
            out.push_str(&format!("-D {} {}\n", self.name, rule));
        }
        // Each insertion lands at the top of the chain, so they are issued in reverse.
        for rule in tagged(RuleState::Insert).collect::<Vec<_>>().into_iter().rev() {
            out.push_str(&format!("-I {} {}\n", self.name, rule));
        }
        if self.render_state == ChainState::Keep {
            for rule in tagged(RuleState::Append) {
                out.push_str(&format!("-A {} {}\n", self.name, rule));
            }
        }
    }
}

// === impl IpRule ===

impl IpRule {
    pub fn new(matches: &str, target: Option<Target>) -> Self {
        Self {
            matches: normalize(matches),
            target,
            render_state: RuleState::Append,
        }
    }

    /// A rule that jumps to `chain` when `matches` apply.
    pub fn jump(matches: &str, chain: impl Into<String>) -> Self {
        Self::new(matches, Some(Target::Jump(chain.into())))
    }

    pub fn with_state(mut self, render_state: RuleState) -> Self {
        self.render_state = render_state;
        self
    }

    /// Compares rules by matches and target, ignoring how they are rendered.
    pub fn same_body(&self, other: &Self) -> bool {
        self.matches == other.matches && self.target == other.target
    }

    fn is_catch_all(&self) -> bool {
        self.matches.is_empty()
            && matches!(
                &self.target,
                Some(Target::Jump(t)) if CATCH_ALL_TARGETS.contains(&t.as_str())
            )
    }

    /// Parses a rule body, splitting it at the last `-j` or `-g` flag.
    fn parse(body: &str) -> Result<Self, ParseErrorKind> {
        let tokens = body.split_whitespace().collect::<Vec<_>>();
        let flag = tokens
            .iter()
            .rposition(|t| matches!(*t, "-j" | "--jump" | "-g" | "--goto"));
        let Some(idx) = flag else {
            return Ok(Self::new(body, None));
        };

        let target = tokens[idx + 1..].join(" ");
        if target.is_empty() {
            return Err(ParseErrorKind::EmptyTarget);
        }
        let target = match tokens[idx] {
            "-g" | "--goto" => Target::Goto(target),
            _ => Target::Jump(target),
        };
        Ok(Self::new(&tokens[..idx].join(" "), Some(target)))
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.matches.is_empty(), &self.target) {
            (_, None) => f.write_str(&self.matches),
            (true, Some(target)) => target.fmt(f),
            (false, Some(target)) => write!(f, "{} {}", self.matches, target),
        }
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// === impl Target ===

impl Target {
    /// The targeted chain, without target options.
    pub fn chain(&self) -> &str {
        let (Self::Jump(t) | Self::Goto(t)) = self;
        t.split_whitespace().next().unwrap_or_default()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jump(t) => write!(f, "-j {t}"),
            Self::Goto(t) => write!(f, "-g {t}"),
        }
    }
}
