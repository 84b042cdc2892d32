//! CIDR feed parsing.
//!
//! Country feeds are plain text with one IPv4 CIDR per line. Feeds come from a
//! third party, so anything that does not parse is skipped: comments, blank
//! lines, IPv6 ranges, HTML error pages, truncated lines.

use crate::policy::Prefix;

/// Lazily parse a feed into prefixes, skipping lines that are not valid IPv4
/// CIDRs or bare IPv4 addresses.
///
/// `#` and `;` start a comment, either on a line of its own or after an entry.
pub fn parse_feed(content: &str) -> impl Iterator<Item = Prefix> + '_ {
    content.lines().filter_map(parse_line)
}

/// Parse a single feed line. `None` means the line is skipped.
pub fn parse_line(line: &str) -> Option<Prefix> {
    entry_text(line)?.parse().ok()
}

/// The part of a line before any comment, if it is not blank
fn entry_text(line: &str) -> Option<&str> {
    let entry = line.split(['#', ';']).next().map(str::trim)?;
    (!entry.is_empty()).then_some(entry)
}

/// Summary of a parsed feed, used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Non-empty, non-comment lines
    pub lines: usize,
    /// Lines that produced a prefix
    pub parsed: usize,
}

impl FeedSummary {
    pub fn skipped(&self) -> usize {
        self.lines - self.parsed
    }
}

/// Parse a feed eagerly and report how many candidate lines were skipped.
pub fn parse_feed_with_summary(content: &str) -> (Vec<Prefix>, FeedSummary) {
    let prefixes: Vec<Prefix> = parse_feed(content).collect();
    let summary = FeedSummary {
        lines: content.lines().filter_map(entry_text).count(),
        parsed: prefixes.len(),
    };
    (prefixes, summary)
}
