//! Bracket host-range expansion: `node[01-03],gpu[1,4-5]`.

use crate::error::{Error, Result};

/// Expand a comma-separated list of host terms into a deduplicated list,
/// preserving first-seen order.
///
/// Each term may contain at most one bracket group holding comma-separated
/// numbers or inclusive ranges. Zero padding follows the width of the range
/// start (`01-10` yields `01 … 10`).
pub fn expand(expression: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for term in split_terms(expression) {
        for name in expand_term(expression, &term)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Split on commas that are not inside brackets.
fn split_terms(expression: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in expression.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                terms.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    terms.push(current);
    terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn expand_term(expression: &str, term: &str) -> Result<Vec<String>> {
    let invalid = |reason: &str| Error::InvalidHostRange {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let Some(open) = term.find('[') else {
        if term.contains(']') {
            return Err(invalid("unbalanced ']'"));
        }
        return Ok(vec![term.to_string()]);
    };
    let close = term[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| invalid("unbalanced '['"))?;

    let prefix = &term[..open];
    let body = &term[open + 1..close];
    let suffix = &term[close + 1..];
    if suffix.contains('[') || suffix.contains(']') {
        return Err(invalid("only one bracket group per term is supported"));
    }

    let mut out = Vec::new();
    for part in body.split(',').map(str::trim) {
        match part.split_once('-') {
            Some((start, end)) => {
                let width = start.len();
                let lo: u64 = start.parse().map_err(|_| invalid("range start is not a number"))?;
                let hi: u64 = end.parse().map_err(|_| invalid("range end is not a number"))?;
                if lo > hi {
                    return Err(invalid("range start is greater than range end"));
                }
                for n in lo..=hi {
                    out.push(format!("{prefix}{n:0width$}{suffix}"));
                }
            }
            None => {
                if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid("bracket entries must be numbers or ranges"));
                }
                out.push(format!("{prefix}{part}{suffix}"));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(expand("n1,n2").unwrap(), vec!["n1", "n2"]);
    }

    #[test]
    fn padded_range() {
        assert_eq!(
            expand("node[01-03]").unwrap(),
            vec!["node01", "node02", "node03"]
        );
    }

    #[test]
    fn mixed_entries_and_dedup() {
        assert_eq!(
            expand("gpu[1,3-4],gpu3,login").unwrap(),
            vec!["gpu1", "gpu3", "gpu4", "login"]
        );
    }

    #[test]
    fn suffix_is_kept() {
        assert_eq!(expand("r[1-2]-a").unwrap(), vec!["r1-a", "r2-a"]);
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(expand("node[3-1]").is_err());
        assert!(expand("node[01-03").is_err());
        assert!(expand("node[a-b]").is_err());
    }
}
