//! An in-memory model of ipset configuration.
//!
//! Only the two set types used for policy enforcement are modeled: `hash:net` sets of IPv4
//! prefixes and `list:set` sets of other sets. Desired configurations are compared with the
//! `ipset save` output of the host to produce an `ipset restore` script.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ipnet::{IpNet, Ipv4Net};
use std::{collections::BTreeMap, fmt, net::Ipv4Addr, str::FromStr};

/// The kernel's limit on set names, excluding the terminating NUL.
pub const MAX_NAME_LEN: usize = 31;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetType {
    HashNet,
    ListSet,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Member {
    Net(Ipv4Net),
    Set(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Set {
    name: String,
    set_type: SetType,

    /// Unique, in insertion order.
    members: Vec<Member>,
}

/// A collection of uniquely named sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ipset {
    sets: BTreeMap<String, Set>,
}

/// A single `ipset restore` command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Create { set: String, set_type: SetType },
    Add { set: String, member: Member },
    Del { set: String, member: Member },
}

/// The changes needed to move the host from its live configuration to a desired one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub commands: Vec<Command>,

    /// Managed live sets that are not desired, in an order in which they can be destroyed.
    pub stale: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SetError {
    #[error("invalid set name {0:?}")]
    InvalidName(String),

    #[error("set {set} is a {existing} set, not {requested}")]
    TypeConflict {
        set: String,
        existing: SetType,
        requested: SetType,
    },

    #[error("{member} can't be a member of {set_type} set {set}")]
    MemberMismatch {
        set: String,
        set_type: SetType,
        member: Member,
    },

    #[error("{0} is not an IPv4 network")]
    UnsupportedFamily(IpNet),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

// === impl SetType ===

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashNet => f.write_str("hash:net"),
            Self::ListSet => f.write_str("list:set"),
        }
    }
}

impl FromStr for SetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash:net" => Ok(Self::HashNet),
            "list:set" => Ok(Self::ListSet),
            s => Err(format!("unsupported set type {s}")),
        }
    }
}

// === impl Member ===

impl Member {
    /// Converts a network into a `hash:net` member. Host bits are cleared, as the kernel does.
    pub fn net(net: IpNet) -> Result<Self, SetError> {
        match net {
            IpNet::V4(net) => Ok(Self::Net(net.trunc())),
            IpNet::V6(_) => Err(SetError::UnsupportedFamily(net)),
        }
    }

    fn parse(set_type: SetType, s: &str) -> Result<Self, String> {
        match set_type {
            SetType::ListSet => Ok(Self::Set(s.to_string())),
            SetType::HashNet => {
                if let Ok(net) = s.parse::<Ipv4Net>() {
                    return Ok(Self::Net(net.trunc()));
                }
                s.parse::<Ipv4Addr>()
                    .map(|addr| Self::Net(Ipv4Net::from(addr)))
                    .map_err(|_| format!("invalid hash:net member {s}"))
            }
        }
    }

    fn fits(&self, set_type: SetType) -> bool {
        matches!(
            (self, set_type),
            (Self::Net(_), SetType::HashNet) | (Self::Set(_), SetType::ListSet)
        )
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(net) => write!(f, "{net}"),
            Self::Set(name) => f.write_str(name),
        }
    }
}

// === impl Set ===

impl Set {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_type(&self) -> SetType {
        self.set_type
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    /// Adds a member, returning false if it was already present.
    pub fn add_member(&mut self, member: Member) -> Result<bool, SetError> {
        if !member.fits(self.set_type) {
            return Err(SetError::MemberMismatch {
                set: self.name.clone(),
                set_type: self.set_type,
                member,
            });
        }
        if self.contains(&member) {
            return Ok(false);
        }
        self.members.push(member);
        Ok(true)
    }

    pub fn add_net(&mut self, net: IpNet) -> Result<bool, SetError> {
        self.add_member(Member::net(net)?)
    }
}

// === impl Ipset ===

impl Ipset {
    pub fn get(&self, name: &str) -> Option<&Set> {
        self.sets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Iterates over sets with every `hash:net` set before any `list:set`.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Set> {
        let of = |t: SetType| self.sets.values().filter(move |s| s.set_type == t);
        of(SetType::HashNet).chain(of(SetType::ListSet))
    }

    /// Returns the named set, creating it if it does not exist.
    ///
    /// Fails if the name is invalid or if a set of a different type already has this name.
    pub fn upsert(&mut self, name: &str, set_type: SetType) -> Result<&mut Set, SetError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(char::is_whitespace) {
            return Err(SetError::InvalidName(name.to_string()));
        }
        let set = self.sets.entry(name.to_string()).or_insert_with(|| Set {
            name: name.to_string(),
            set_type,
            members: Vec::new(),
        });
        if set.set_type != set_type {
            return Err(SetError::TypeConflict {
                set: name.to_string(),
                existing: set.set_type,
                requested: set_type,
            });
        }
        Ok(set)
    }

    /// Renders the configuration in the `ipset save` format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for set in self.iter() {
            out.push_str(&format!("create {} {}\n", set.name, set.set_type));
        }
        for set in self.iter() {
            for member in &set.members {
                out.push_str(&format!("add {} {}\n", set.name, member));
            }
        }
        out
    }

    /// Computes the commands that turn `live` into `self`.
    ///
    /// Live sets for which `is_managed` returns false are never touched.
    pub fn diff(&self, live: &Ipset, is_managed: impl Fn(&str) -> bool) -> Result<Diff, SetError> {
        let mut creates = Vec::new();
        let mut dels = Vec::new();
        let mut adds = Vec::new();

        for set in self.iter() {
            let current = match live.get(&set.name) {
                Some(current) if current.set_type != set.set_type => {
                    return Err(SetError::TypeConflict {
                        set: set.name.clone(),
                        existing: current.set_type,
                        requested: set.set_type,
                    });
                }
                Some(current) => Some(current),
                None => {
                    creates.push(Command::Create {
                        set: set.name.clone(),
                        set_type: set.set_type,
                    });
                    None
                }
            };

            if let Some(current) = current {
                dels.extend(
                    current
                        .members
                        .iter()
                        .filter(|m| !set.contains(m))
                        .map(|m| Command::Del {
                            set: set.name.clone(),
                            member: m.clone(),
                        }),
                );
            }
            adds.extend(
                set.members
                    .iter()
                    .filter(|m| !current.map_or(false, |c| c.contains(m)))
                    .map(|m| Command::Add {
                        set: set.name.clone(),
                        member: m.clone(),
                    }),
            );
        }

        // Lists must go before the sets they reference.
        let stale = live
            .iter()
            .rev()
            .filter(|s| is_managed(&s.name) && !self.contains(&s.name))
            .map(|s| s.name.clone())
            .collect();

        let mut commands = creates;
        commands.extend(dels);
        commands.extend(adds);
        Ok(Diff { commands, stale })
    }
}

impl FromStr for Ipset {
    type Err = SetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_save(s, |_| true)
    }
}

impl Ipset {
    /// Parses `ipset save` output, keeping only the sets for which `keep` returns true.
    ///
    /// Sets of unsupported types or of the IPv6 family are skipped along with their members.
    pub fn from_save(s: &str, keep: impl Fn(&str) -> bool) -> Result<Self, SetError> {
        let mut ipset = Ipset::default();
        for (idx, line) in s.lines().enumerate() {
            let err = |reason: String| SetError::Parse {
                line: idx + 1,
                reason,
            };
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (None, _, _) => {}
                (Some(cmd), _, _) if cmd.starts_with('#') => {}
                (Some("create"), Some(name), Some(set_type)) => {
                    if !keep(name) || is_inet6(words) {
                        continue;
                    }
                    if let Ok(set_type) = set_type.parse() {
                        ipset.upsert(name, set_type)?;
                    }
                }
                (Some("add"), Some(name), Some(member)) => {
                    let Some(set) = ipset.sets.get_mut(name) else {
                        continue;
                    };
                    let member = Member::parse(set.set_type, member).map_err(err)?;
                    set.add_member(member)?;
                }
                _ => return Err(err(format!("unsupported line: {}", line.trim()))),
            }
        }
        Ok(ipset)
    }
}

/// Checks the options of a `create` line for `family inet6`.
fn is_inet6<'l>(mut options: impl Iterator<Item = &'l str>) -> bool {
    while let Some(option) = options.next() {
        if option == "family" {
            return options.next() == Some("inet6");
        }
    }
    false
}

// === impl Diff ===

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Renders the commands as an `ipset restore` script.
    pub fn script(&self) -> String {
        self.commands.iter().map(|c| format!("{c}\n")).collect()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { set, set_type } => write!(f, "create {set} {set_type}"),
            Self::Add { set, member } => write!(f, "add {set} {member}"),
            Self::Del { set, member } => write!(f, "del {set} {member}"),
        }
    }
}
