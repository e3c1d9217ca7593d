//! Search response reshaping
//!
//! Upstream is always asked for values, so the relay has to apply the
//! client's "no attributes" and "types only" requests itself. Afterwards every
//! `attribute=value` assertion in the client filter is backfilled into each
//! entry, so a client that matches results against its own query finds the
//! attribute it asked about.

use crate::proto::{Attribute, Entry};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref EQUALITY: Regex = Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9.\-]*)\s*=\s*(.*)$")
        .expect("Failed to compile equality clause pattern");
}

/// Split a filter into its leaf clauses.
///
/// Every innermost parenthesised group is a leaf; a string without any
/// parenthesised group is itself a single leaf.
pub fn leaf_clauses(filter: &str) -> Vec<String> {
    let mut leaves = Vec::new();
    collect_leaves(filter, &mut leaves);
    leaves
}

fn collect_leaves(filter: &str, leaves: &mut Vec<String>) {
    let mut start: Option<usize> = None;
    let mut descended = false;

    for (pos, c) in filter.char_indices() {
        match c {
            '(' if pos + 1 < filter.len() => start = Some(pos + 1),
            ')' => {
                if let Some(s) = start.take() {
                    descended = true;
                    collect_leaves(&filter[s..pos], leaves);
                }
            }
            _ => {}
        }
    }

    if !descended {
        leaves.push(filter.to_string());
    }
}

/// Split an equality clause into attribute name and unescaped value.
///
/// Clauses that are not plain equality assertions (presence, substring,
/// ordering, approximate or extensible matches) yield `None`.
pub fn parse_equality(clause: &str) -> Option<(String, String)> {
    let caps = EQUALITY.captures(clause)?;
    let name = caps.get(1)?.as_str();
    let value = caps.get(2)?.as_str();
    if value.contains('*') {
        return None;
    }
    Some((name.to_string(), unescape_value(value)))
}

/// Decode RFC 4515 `\XX` escapes; malformed escapes are kept verbatim
fn unescape_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Apply attribute suppression and filter backfill to upstream entries
pub fn reshape_entries(entries: &mut [Entry], filter: &str, want_attributes: bool, types_only: bool) {
    if !want_attributes {
        debug!("search without attributes");
        for entry in entries.iter_mut() {
            entry.attributes.clear();
        }
        return;
    }

    if types_only {
        debug!("search for attribute types only");
        for entry in entries.iter_mut() {
            for attribute in entry.attributes.iter_mut() {
                attribute.values.clear();
            }
        }
    }

    for clause in leaf_clauses(filter) {
        let Some((name, value)) = parse_equality(&clause) else {
            continue;
        };
        for entry in entries.iter_mut() {
            backfill(entry, &name, &value);
        }
    }
}

fn backfill(entry: &mut Entry, name: &str, value: &str) {
    match entry
        .attributes
        .iter_mut()
        .find(|a| a.name.eq_ignore_ascii_case(name))
    {
        Some(attribute) => {
            if value.is_empty() {
                attribute.values = vec![Vec::new()];
            }
        }
        None => entry.attributes.push(Attribute::new(name, vec![value])),
    }
}
