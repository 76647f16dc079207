//! Path normalization used for partitioning and map keys.
//!
//! Every path entering the cache is normalized once at the API boundary and
//! the normalized form is used everywhere below: as the partitioned map key,
//! as the routing key for remote tasks, and inside topic messages. The rule
//! must therefore be deterministic and cheap, since it sits on the hot
//! open/read/write/close path.
//!
//! The rule:
//! - Split the path at the last directory separator (`\` or `/`).
//! - Uppercase ASCII `a`-`z` only in the directory part.
//! - When case-sensitive mode is on, append the file-name component
//!   unchanged; otherwise uppercase the whole string.

/// Canonical directory separator for normalized paths.
pub const SEPARATOR: char = '\\';

/// Returns the byte index just past the last directory separator, or `None`
/// if the path has no separator.
fn last_separator(path: &str) -> Option<usize> {
    path.rfind(['\\', '/']).map(|idx| idx + 1)
}

/// Uppercases ASCII `a`-`z` in place, leaving every other byte untouched.
///
/// Non-ASCII bytes are preserved as-is; the partitioning rule only folds
/// the ASCII range.
fn upper_ascii_into(out: &mut String, part: &str) {
    for ch in part.chars() {
        out.push(ch.to_ascii_uppercase());
    }
}

/// Normalizes a path for use as a cache/partition key.
///
/// # Arguments
///
/// * `path` - Raw path as received from the protocol layer
/// * `case_sensitive` - Whether the file-name component preserves its case
///
/// # Returns
///
/// The normalized path string. Normalization is idempotent:
/// `normalize(normalize(p)) == normalize(p)` for any `p`.
pub fn normalize(path: &str, case_sensitive: bool) -> String {
    let mut out = String::with_capacity(path.len());
    match (case_sensitive, last_separator(path)) {
        (true, Some(split)) => {
            upper_ascii_into(&mut out, &path[..split]);
            out.push_str(&path[split..]);
        }
        (true, None) => out.push_str(path),
        (false, _) => upper_ascii_into(&mut out, path),
    }
    out
}

/// Checks whether `path` lies underneath the folder `prefix`.
///
/// Matches only whole components: `\FOO\BAR.TXT` is under `\FOO`, while
/// `\FOOD.TXT` is not. Both arguments must already be normalized.
pub fn is_under_folder(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.starts_with(['\\', '/']),
        None => false,
    }
}

/// Rewrites `path` from underneath `old_prefix` to underneath `new_prefix`,
/// preserving the tail. Returns `None` when `path` is not under
/// `old_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if !is_under_folder(path, old_prefix) {
        return None;
    }
    let tail = &path[old_prefix.len()..];
    let mut out = String::with_capacity(new_prefix.len() + tail.len());
    out.push_str(new_prefix);
    out.push_str(tail);
    Some(out)
}
