//! Binding-pattern matching for routing keys.
//!
//! A binding pattern is a literal string in which each `*` matches any
//! (possibly empty) substring; every other character matches itself.
//! Matching is anchored at both ends, equivalent to SQL `LIKE` with `*` in
//! place of `%`. There is no hierarchy, no character classes, and no escape
//! syntax.

/// Returns true when `routing_key` matches `pattern`.
///
/// An empty pattern matches only the empty key; a pattern of just `*`
/// matches every key.
///
/// # Example
///
/// ```
/// use courier_core::pattern::matches;
///
/// assert!(matches("order.created", "order.*"));
/// assert!(matches("order.created", "*"));
/// assert!(!matches("payment.settled", "order.*"));
/// ```
pub fn matches(routing_key: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return routing_key == pattern;
    }

    let mut segments = pattern.split('*');
    // First segment is anchored at the start of the key.
    let Some(rest) = segments.next().and_then(|head| routing_key.strip_prefix(head)) else {
        return false;
    };

    let segments: Vec<&str> = segments.collect();
    let mut remaining = rest;

    for (i, segment) in segments.iter().enumerate() {
        if i == segments.len() - 1 {
            // Last segment is anchored at the end; the preceding `*`
            // absorbs whatever is left over.
            return remaining.ends_with(segment);
        }
        // Middle segments match leftmost-first; the wildcards on either
        // side absorb the gaps.
        match remaining.find(segment) {
            Some(pos) => remaining = &remaining[pos + segment.len()..],
            None => return false,
        }
    }

    true
}
