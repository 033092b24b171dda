//! Text rendering helpers for diagnostics.
//!
//! Used by the container to print resolution paths and key names, and by
//! the RPC layer to hint at aliases when a lookup misses.

/// Joins a resolution path into a single readable line.
///
/// # Examples
/// ```
/// use siyaq_support::rendering::render_path;
///
/// let path = vec!["Orders", "Transaction", "Pool", "Orders"];
/// assert_eq!(render_path(&path), "Orders → Transaction → Pool → Orders");
/// ```
pub fn render_path(path: &[impl AsRef<str>]) -> String {
    path.iter()
        .map(|segment| segment.as_ref())
        .collect::<Vec<_>>()
        .join(" → ")
}

/// Strips module paths from a type name, keeping generics readable.
///
/// ```
/// use siyaq_support::rendering::short_type_name;
///
/// assert_eq!(short_type_name("app::db::Pool"), "Pool");
/// assert_eq!(
///     short_type_name("alloc::sync::Arc<dyn app::mail::Mailer>"),
///     "Arc<dyn Mailer>"
/// );
/// ```
pub fn short_type_name(full_name: &str) -> String {
    let mut out = String::with_capacity(full_name.len());
    let mut segment = String::new();
    let mut chars = full_name.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | '&' => {
                out.push_str(&segment);
                out.push(ch);
                segment.clear();
            }
            _ => segment.push(ch),
        }
    }

    out.push_str(&segment);
    out
}

/// Picks up to `limit` candidates that look like `requested`.
///
/// Matching is case-insensitive; substring hits rank above shared prefixes.
/// Prefixes shorter than three characters are ignored.
pub fn closest_matches<'a>(
    requested: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    limit: usize,
) -> Vec<String> {
    let wanted = requested.to_lowercase();

    let mut scored: Vec<(&str, usize)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let lower = candidate.to_lowercase();
            if lower == wanted {
                return None;
            }
            if lower.contains(&wanted) || wanted.contains(&lower) {
                return Some((candidate, 100));
            }
            let prefix = lower
                .chars()
                .zip(wanted.chars())
                .take_while(|(a, b)| a == b)
                .count();
            (prefix >= 3).then_some((candidate, prefix * 10))
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    scored
        .into_iter()
        .take(limit)
        .map(|(name, _)| name.to_string())
        .collect()
}
