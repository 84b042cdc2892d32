//! Policy data model: countries, prefixes, actions and the entry sets that the
//! reconciliation engine diffs against the enforcement backend.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Lowercase two-letter country identifier (e.g. `us`, `de`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        // Both bytes are ASCII lowercase letters, checked in from_str
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl FromStr for CountryCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = trimmed.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(format!(
                "Invalid country code '{}': expected two ASCII letters",
                trimmed
            ));
        }
        Ok(Self([
            bytes[0].to_ascii_lowercase(),
            bytes[1].to_ascii_lowercase(),
        ]))
    }
}

impl TryFrom<String> for CountryCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(cc: CountryCode) -> Self {
        cc.as_str().to_string()
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An IPv4 CIDR block, stored as network address + prefix length.
///
/// Host bits are masked on construction, so `1.2.3.4/16` and `1.2.0.0/16` are
/// the same prefix. Nothing else is normalized: `10.0.0.0/8` and `10.1.0.0/16`
/// stay two distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix {
    addr: u32,
    len: u8,
}

impl Prefix {
    /// Build a prefix, masking host bits. Returns `None` for lengths above 32.
    pub fn new(addr: u32, len: u8) -> Option<Self> {
        if len > 32 {
            return None;
        }
        Some(Self {
            addr: addr & mask(len),
            len,
        })
    }

    /// Network address as a host-order integer.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

fn mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

impl From<Ipv4Net> for Prefix {
    fn from(net: Ipv4Net) -> Self {
        Self {
            addr: u32::from(net.network()),
            len: net.prefix_len(),
        }
    }
}

impl From<Ipv4Addr> for Prefix {
    fn from(ip: Ipv4Addr) -> Self {
        Self {
            addr: u32::from(ip),
            len: 32,
        }
    }
}

impl FromStr for Prefix {
    type Err = String;

    /// Parse `a.b.c.d/len`, or a bare address as a `/32`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = if s.contains('/') {
            s.parse::<Ipv4Net>().map(Self::from).ok()
        } else {
            s.parse::<Ipv4Addr>().map(Self::from).ok()
        };
        parsed.ok_or_else(|| format!("Invalid IPv4 CIDR: {}", s))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.len)
    }
}

/// Process-wide filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only traffic from the configured countries is accepted
    Allow,
    /// Traffic from the configured countries is dropped
    Deny,
}

impl Mode {
    /// The action applied to every prefix of every configured country.
    pub fn action(self) -> Action {
        match self {
            Mode::Allow => Action::Allow,
            Mode::Deny => Action::Deny,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Allow => "allow",
            Mode::Deny => "deny",
        })
    }
}

/// What the backend does with a packet whose source matches an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }

    /// Single-byte encoding used by the kernel map: 1 passes, 0 drops.
    pub fn to_byte(self) -> u8 {
        match self {
            Action::Allow => 1,
            Action::Deny => 0,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Action::Allow),
            0 => Some(Action::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            other => Err(format!("Unknown action: {}", other)),
        }
    }
}

/// How entries are grouped into backend sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetLayout {
    /// One set per country (`deny_us`, `deny_de`, ...)
    #[default]
    PerCountry,
    /// A single set holding every country's prefixes (`deny_all`)
    Merged,
}

impl SetLayout {
    pub fn group_for(self, country: CountryCode) -> Group {
        match self {
            SetLayout::PerCountry => Group::Country(country),
            SetLayout::Merged => Group::All,
        }
    }
}

impl fmt::Display for SetLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetLayout::PerCountry => "per-country",
            SetLayout::Merged => "merged",
        })
    }
}

impl FromStr for SetLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-country" => Ok(SetLayout::PerCountry),
            "merged" => Ok(SetLayout::Merged),
            _ => Err(format!(
                "Invalid layout: {}. Valid values: per-country, merged",
                s
            )),
        }
    }
}

/// The grouping an entry belongs to inside the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    Country(CountryCode),
    All,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Country(cc) => write!(f, "{}", cc),
            Group::All => f.write_str("all"),
        }
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(Group::All)
        } else {
            s.parse().map(Group::Country)
        }
    }
}

/// Identifies one backend set: a group plus the action its rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetKey {
    pub group: Group,
    pub action: Action,
}

impl SetKey {
    pub fn new(group: Group, action: Action) -> Self {
        Self { group, action }
    }

    /// Backend name of the set, e.g. `deny_us` or `allow_all`.
    pub fn set_name(&self) -> String {
        format!("{}_{}", self.action, self.group)
    }

    /// Inverse of [`SetKey::set_name`]. Returns `None` for names geogate does
    /// not own.
    pub fn from_set_name(name: &str) -> Option<Self> {
        let (action, group) = name.split_once('_')?;
        Some(Self {
            action: action.parse().ok()?,
            group: group.parse().ok()?,
        })
    }
}

impl fmt::Display for SetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.set_name())
    }
}

/// The atomic unit stored in the enforcement backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyEntry {
    pub group: Group,
    pub prefix: Prefix,
    pub action: Action,
}

impl PolicyEntry {
    pub fn new(group: Group, prefix: Prefix, action: Action) -> Self {
        Self {
            group,
            prefix,
            action,
        }
    }

    pub fn set_key(&self) -> SetKey {
        SetKey::new(self.group, self.action)
    }
}

impl fmt::Display for PolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.prefix, self.action, self.group)
    }
}

/// A set of policy entries, ordered for deterministic scripts and logs.
pub type EntrySet = BTreeSet<PolicyEntry>;

/// The enforcement state computed fresh on every pass.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    entries: EntrySet,
    countries: BTreeSet<CountryCode>,
}

impl DesiredState {
    /// Build the desired state from the prefixes of every country whose feed
    /// was fetched this pass. The same prefix listed by two countries under the
    /// merged layout collapses into one entry.
    pub fn build<I, P>(mode: Mode, layout: SetLayout, feeds: I) -> Self
    where
        I: IntoIterator<Item = (CountryCode, P)>,
        P: IntoIterator<Item = Prefix>,
    {
        let action = mode.action();
        let mut state = Self::default();
        for (country, prefixes) in feeds {
            let group = layout.group_for(country);
            state.countries.insert(country);
            state.entries.extend(
                prefixes
                    .into_iter()
                    .map(|prefix| PolicyEntry::new(group, prefix, action)),
            );
        }
        state
    }

    pub fn entries(&self) -> &EntrySet {
        &self.entries
    }

    /// Countries whose feeds contributed to this state.
    pub fn countries(&self) -> &BTreeSet<CountryCode> {
        &self.countries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutations needed to turn the live state into the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDiff {
    pub to_add: EntrySet,
    pub to_remove: EntrySet,
}

impl PolicyDiff {
    /// `to_add = desired - live`, `to_remove = live - desired`. Entries present
    /// in both are never touched.
    pub fn between(live: &EntrySet, desired: &EntrySet) -> Self {
        Self {
            to_add: desired.difference(live).copied().collect(),
            to_remove: live.difference(desired).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Every set touched by this diff.
    pub fn touched_sets(&self) -> BTreeSet<SetKey> {
        self.to_add
            .iter()
            .chain(self.to_remove.iter())
            .map(PolicyEntry::set_key)
            .collect()
    }
}
