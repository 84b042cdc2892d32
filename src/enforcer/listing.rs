//! Parser for `nft list table` text output.
//!
//! `nft` has no stable typed read API for set contents and counters on every
//! distribution we target, so the listing is pattern-matched here and nowhere
//! else. The accepted grammar, one statement per line after trimming:
//!
//! ```text
//! set-open      = "set" NAME "{"
//! elements-open = "elements" "=" "{" element-list ["}"]
//! element-list  = element *("," element) [","]
//! element       = IPV4 ["/" LEN] *(WORD)           ; trailing words ignored
//! counter-open  = "counter" NAME "{"
//! counter-body  = "packets" NUM "bytes" NUM
//! rule-counter  = ... "@" NAME ... "counter" "packets" NUM "bytes" NUM ...
//! close         = "}"
//! ```
//!
//! Element lists may span several lines. Anything else is ignored.

use std::collections::BTreeMap;

use crate::policy::Prefix;

/// Sets and counters found in one table listing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableListing {
    /// Set name -> elements, in listing order
    pub sets: BTreeMap<String, Vec<Prefix>>,
    /// Counter (or set referenced by a counting rule) -> (packets, bytes)
    pub counters: BTreeMap<String, (u64, u64)>,
    /// Element tokens that were not IPv4 prefixes (ranges, IPv6)
    pub unparsed_elements: usize,
}

enum State {
    Top,
    Set(String),
    Elements(String),
    Counter(String),
}

/// Parse the text output of `nft list table <family> <name>`.
pub fn parse_table_listing(output: &str) -> TableListing {
    let mut listing = TableListing::default();
    let mut state = State::Top;

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        state = match state {
            State::Top => {
                if let Some(name) = block_name(line, "set") {
                    listing.sets.entry(name.clone()).or_default();
                    State::Set(name)
                } else if let Some(name) = block_name(line, "counter") {
                    State::Counter(name)
                } else {
                    if let Some((name, packets, bytes)) = parse_rule_counter(line) {
                        let entry = listing.counters.entry(name).or_default();
                        entry.0 += packets;
                        entry.1 += bytes;
                    }
                    State::Top
                }
            }
            State::Set(name) => {
                if line == "}" {
                    State::Top
                } else if let Some(rest) = elements_start(line) {
                    if collect_elements(rest, &name, &mut listing) {
                        State::Set(name)
                    } else {
                        State::Elements(name)
                    }
                } else {
                    State::Set(name)
                }
            }
            State::Elements(name) => {
                if collect_elements(line, &name, &mut listing) {
                    State::Set(name)
                } else {
                    State::Elements(name)
                }
            }
            State::Counter(name) => {
                if line == "}" {
                    State::Top
                } else {
                    if let (Some(packets), Some(bytes)) = (
                        extract_number_after(line, "packets"),
                        extract_number_after(line, "bytes"),
                    ) {
                        listing.counters.insert(name.clone(), (packets, bytes));
                    }
                    State::Counter(name)
                }
            }
        };
    }

    listing
}

/// `set NAME {` / `counter NAME {` -> NAME
fn block_name(line: &str, keyword: &str) -> Option<String> {
    let rest = line.strip_prefix(keyword)?.strip_prefix(' ')?;
    let name = rest.strip_suffix('{')?.trim().trim_matches('"');
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name.to_string())
}

/// `elements = { ...` -> text after the opening brace
fn elements_start(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("elements")?.trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    rest.strip_prefix('{')
}

/// Add the elements on one line to `name`. Returns true when the closing
/// brace of the element list was seen.
fn collect_elements(fragment: &str, name: &str, listing: &mut TableListing) -> bool {
    let (body, closed) = match fragment.find('}') {
        Some(idx) => (&fragment[..idx], true),
        None => (fragment, false),
    };

    for token in body.split(',') {
        let Some(element) = token.split_whitespace().next() else {
            continue;
        };
        match element.parse::<Prefix>() {
            Ok(prefix) => listing.sets.entry(name.to_string()).or_default().push(prefix),
            Err(_) => listing.unparsed_elements += 1,
        }
    }

    closed
}

/// A rule line such as `ip saddr @deny_us counter packets 12 bytes 3456 drop`
fn parse_rule_counter(line: &str) -> Option<(String, u64, u64)> {
    if !line.contains("counter") {
        return None;
    }
    let set = line
        .split_whitespace()
        .find_map(|word| word.strip_prefix('@'))?;
    let packets = extract_number_after(line, "packets")?;
    let bytes = extract_number_after(line, "bytes")?;
    Some((set.to_string(), packets, bytes))
}

/// Extract the number following a keyword (e.g. "packets 123" -> 123)
fn extract_number_after(s: &str, keyword: &str) -> Option<u64> {
    let mut words = s.split_whitespace();
    words.find(|w| *w == keyword)?;
    words.next()?.parse().ok()
}
