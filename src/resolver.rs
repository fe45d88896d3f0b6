//! Command template resolution.
//!
//! Service commands reference interface aliases positionally: `$IP` is the
//! first address of the owning environment, `$IP2` the second, `$IPn` the
//! nth. Resolution behaves as if tokens were substituted from the highest
//! number down to `$IP`, so the bare token never corrupts a numbered one.
//! Tokens referencing an address beyond the supplied list are left verbatim
//! and reported by [`missing_variables`] instead of being blanked out.

use regex::Regex;
use std::sync::OnceLock;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$IP([0-9]*)").expect("valid token regex"))
}

/// Positional index (1-based) for a captured token suffix.
fn token_index(suffix: &str) -> Option<usize> {
    if suffix.is_empty() {
        return Some(1);
    }
    match suffix.parse::<usize>() {
        // `$IP1` is not a defined token; the first address is plain `$IP`.
        Ok(0) | Ok(1) => None,
        Ok(n) => Some(n),
        Err(_) => None,
    }
}

/// Substitutes `$IP`/`$IPn` tokens in `template` with the matching entries
/// of `addresses`. A single anchored pass over the template is equivalent to
/// replacing tokens highest-number-first: every token is matched whole, so
/// `$IP` never prefix-matches into `$IP2`. Side-effect free.
pub fn resolve_command(template: &str, addresses: &[String]) -> String {
    token_regex()
        .replace_all(template, |caps: &regex::Captures| {
            match token_index(&caps[1]) {
                Some(n) if n <= addresses.len() => addresses[n - 1].clone(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Returns the tokens in `template` that reference addresses beyond the
/// supplied list, in order of first appearance.
pub fn missing_variables(template: &str, addresses: &[String]) -> Vec<String> {
    let mut missing = Vec::new();
    for caps in token_regex().captures_iter(template) {
        let token = caps[0].to_string();
        let unresolved = match token_index(&caps[1]) {
            Some(n) => n > addresses.len(),
            None => true,
        };
        if unresolved && !missing.contains(&token) {
            missing.push(token);
        }
    }
    missing
}
