//! Reversed-key representation of domain names.
//!
//! `mail.example.com` and `www.example.com` share a suffix. Stored reversed
//! (`moc.elpmaxe.liam`, `moc.elpmaxe.www`) they share a prefix, which the
//! sorted primary key of the aggregate tables can range-scan.

/// Reverse the character sequence of `s`.
///
/// Operates on `char`s, so multi-byte code points survive the round trip.
pub fn reverse(s: &str) -> String {
    s.chars().rev().collect()
}

/// Escape `LIKE` metacharacters so `s` matches only itself.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Pattern matching `reversed` itself or any longer name under it.
///
/// `moc.elpmaxe` becomes `moc.elpmaxe.%`, so `notexample.com`
/// (`moc.elpmaxeton`) does not match.
pub fn reversed_suffix_pattern(reversed: &str) -> String {
    format!("{}.%", escape_like(reversed))
}

/// Pattern matching natural-order names ending in `.name`.
pub fn natural_suffix_pattern(name: &str) -> String {
    format!("%.{}", escape_like(name))
}
