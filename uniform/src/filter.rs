//! Subject matching shared by the bus transport and the pending-event queue.
//!
//! Subjects are `.`-separated tokens. In a pattern `*` matches exactly one
//! token and `>` (only as the last token) matches one or more trailing tokens.

/// Whether `pattern` selects `subject`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    if pattern == subject {
        return true;
    }
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether `pattern` contains a wildcard token.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|token| token == "*" || token == ">")
}
