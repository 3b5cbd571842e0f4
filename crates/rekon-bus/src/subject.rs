//! Subject matching.
//!
//! Subjects are dot-separated, non-empty tokens. In filters `*` matches
//! exactly one token and `>` (last token only) matches one or more
//! trailing tokens.

/// Check that a publish subject is well-formed and wildcard-free.
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">")
}

/// Check that a filter is well-formed (`>` only as the final token).
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = filter.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| {
        !t.is_empty() && (*t != ">" || i == tokens.len() - 1)
    })
}

/// Does `subject` fall under `filter`?
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for f in filter.split('.') {
        match (f, subject_tokens.next()) {
            (">", Some(_)) => return true,
            (_, None) => return false,
            ("*", Some(_)) => {}
            (f, Some(s)) if f == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

/// Could any subject match both filters?
pub fn filters_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');
    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some(x), Some(y)) if x == y || x == "*" || y == "*" => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_wildcards() {
        assert!(subject_matches("resources.pipe", "resources.pipe"));
        assert!(!subject_matches("resources.pipe", "resources.pipeline"));
        assert!(subject_matches("resources.*", "resources.pipe"));
        assert!(!subject_matches("resources.*", "resources.pipe.extra"));
        assert!(subject_matches("resources.>", "resources.pipe.extra"));
        assert!(!subject_matches("resources.>", "resources"));
        assert!(!subject_matches("pipelines.>", "resources.pipe"));
        assert!(!subject_matches("resources.pipe.x", "resources.pipe"));
    }

    #[test]
    fn subject_and_filter_validation() {
        assert!(is_valid_subject("pipelines.driver.result"));
        assert!(!is_valid_subject("resources.*"));
        assert!(!is_valid_subject("resources..pipe"));
        assert!(!is_valid_subject(""));
        assert!(is_valid_filter("resources.>"));
        assert!(is_valid_filter("*.pipe"));
        assert!(!is_valid_filter(">.pipe"));
        assert!(!is_valid_filter("resources."));
    }

    #[test]
    fn overlap_detection() {
        assert!(filters_overlap("pipelines.>", "pipelines.driver.result"));
        assert!(filters_overlap("pipelines.*.result", "pipelines.driver.*"));
        assert!(!filters_overlap("pipelines.driver.result", "pipelines.run.started"));
        assert!(!filters_overlap("resources.a", "resources.a.b"));
    }
}
