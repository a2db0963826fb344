//! Subject grammar and wildcard matching.
//!
//! Subjects are dot-separated segments (`relay.agent.backend`). Patterns may
//! additionally use `*` (exactly one segment) and `>` (one or more trailing
//! segments, final position only).

/// Upper bound on subject length in bytes.
pub const MAX_SUBJECT_LEN: usize = 256;
/// Upper bound on the number of dot-separated segments.
pub const MAX_SEGMENTS: usize = 16;

const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("subject must not be empty")]
    Empty,
    #[error("subject is {len} bytes, limit is {MAX_SUBJECT_LEN}")]
    TooLong { len: usize },
    #[error("subject has {count} segments, limit is {MAX_SEGMENTS}")]
    TooManySegments { count: usize },
    #[error("subject contains an empty segment")]
    EmptySegment,
    #[error("segment '{segment}' contains characters outside [A-Za-z0-9_-:@]")]
    InvalidCharacter { segment: String },
    #[error("wildcards are not allowed in a concrete subject")]
    WildcardNotAllowed,
    #[error("'>' is only legal as the final segment")]
    TailWildcardNotLast,
    #[error("wildcard must occupy a whole segment, got '{segment}'")]
    PartialWildcard { segment: String },
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '@')
}

fn check_shape(subject: &str) -> Result<usize, SubjectError> {
    if subject.trim().is_empty() {
        return Err(SubjectError::Empty);
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(SubjectError::TooLong { len: subject.len() });
    }
    let count = subject.split('.').count();
    if count > MAX_SEGMENTS {
        return Err(SubjectError::TooManySegments { count });
    }
    Ok(count)
}

fn check_segment(segment: &str) -> Result<(), SubjectError> {
    if segment.is_empty() {
        return Err(SubjectError::EmptySegment);
    }
    if segment.contains(['*', '>']) {
        return Err(SubjectError::PartialWildcard {
            segment: segment.to_string(),
        });
    }
    if !segment.chars().all(is_segment_char) {
        return Err(SubjectError::InvalidCharacter {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

/// Validate a concrete subject (endpoint address, sender, reply target).
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    check_shape(subject)?;
    for segment in subject.split('.') {
        if segment == SINGLE_WILDCARD || segment == TAIL_WILDCARD {
            return Err(SubjectError::WildcardNotAllowed);
        }
        check_segment(segment)?;
    }
    Ok(())
}

/// Validate a subscription or adapter pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    let count = check_shape(pattern)?;
    for (idx, segment) in pattern.split('.').enumerate() {
        match segment {
            SINGLE_WILDCARD => {}
            TAIL_WILDCARD if idx + 1 == count => {}
            TAIL_WILDCARD => return Err(SubjectError::TailWildcardNotLast),
            other => check_segment(other)?,
        }
    }
    Ok(())
}

/// True if the pattern contains `*` or `>` tokens.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split('.')
        .any(|segment| segment == SINGLE_WILDCARD || segment == TAIL_WILDCARD)
}

/// Match a concrete subject against a pattern.
///
/// Total over all inputs: a malformed pattern or subject matches nothing.
pub fn matches(subject: &str, pattern: &str) -> bool {
    if validate_pattern(pattern).is_err() || validate_subject(subject).is_err() {
        return false;
    }

    let mut subject_segments = subject.split('.');
    let mut pattern_segments = pattern.split('.').peekable();

    while let Some(token) = pattern_segments.next() {
        if token == TAIL_WILDCARD && pattern_segments.peek().is_none() {
            return subject_segments.next().is_some();
        }
        match subject_segments.next() {
            Some(segment) if token == SINGLE_WILDCARD || token == segment => {}
            _ => return false,
        }
    }

    subject_segments.next().is_none()
}

/// The first `depth` segments of a subject, joined back with dots.
///
/// Subjects shorter than `depth` are their own namespace.
pub fn namespace(subject: &str, depth: usize) -> String {
    subject
        .split('.')
        .take(depth.max(1))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_wildcard_matches_exactly_one_segment() {
        assert!(matches("relay.agent.backend", "relay.agent.*"));
        assert!(!matches("relay.agent.backend.extra", "relay.agent.*"));
        assert!(!matches("relay.agent", "relay.agent.*"));
        assert!(matches("relay.agent.backend", "relay.*.backend"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_trailing_segments() {
        assert!(matches("relay.agent.backend.extra", "relay.agent.>"));
        assert!(matches("relay.agent.backend", "relay.agent.>"));
        assert!(!matches("relay.agent", "relay.agent.>"));
        assert!(matches("anything.at.all", ">"));
    }

    #[test]
    fn tail_wildcard_only_legal_in_final_position() {
        assert!(!matches("relay.agent.backend", "relay.>.backend"));
        assert_eq!(
            validate_pattern("relay.>.backend"),
            Err(SubjectError::TailWildcardNotLast)
        );
    }

    #[test]
    fn literal_patterns_require_exact_equality() {
        assert!(matches("relay.agent.backend", "relay.agent.backend"));
        assert!(!matches("relay.agent.backend", "relay.agent.frontend"));
        assert!(!matches("relay.agent", "relay.agent.backend"));
    }

    #[test]
    fn malformed_inputs_never_match() {
        assert!(!matches("relay..backend", "relay.*.backend"));
        assert!(!matches("relay.agent.backend", "relay.ag*"));
        assert!(!matches("", ">"));
        assert!(!matches("relay.agent", ""));
        assert!(!matches("relay.a.", "relay.>"));
        assert!(!matches("relay.a..b", "relay.>"));
        assert!(!matches("relay.a.b c", "relay.*.>"));
        assert!(!matches("relay.agent.*", "relay.agent.*"));
    }

    #[test]
    fn concrete_subject_rejects_wildcards_and_bad_segments() {
        assert!(validate_subject("relay.agent.backend").is_ok());
        assert!(validate_subject("relay.human.telegram.-100123").is_ok());
        assert_eq!(
            validate_subject("relay.agent.*"),
            Err(SubjectError::WildcardNotAllowed)
        );
        assert_eq!(validate_subject("  "), Err(SubjectError::Empty));
        assert_eq!(validate_subject("relay.."), Err(SubjectError::EmptySegment));
        assert!(matches!(
            validate_subject("relay.agent/etc"),
            Err(SubjectError::InvalidCharacter { .. })
        ));
        assert!(matches!(
            validate_subject("relay.ag*ent"),
            Err(SubjectError::PartialWildcard { .. })
        ));
    }

    #[test]
    fn subject_limits_are_enforced() {
        let long = "a".repeat(MAX_SUBJECT_LEN + 1);
        assert!(matches!(
            validate_subject(&long),
            Err(SubjectError::TooLong { .. })
        ));

        let deep = vec!["s"; MAX_SEGMENTS + 1].join(".");
        assert!(matches!(
            validate_subject(&deep),
            Err(SubjectError::TooManySegments { .. })
        ));
    }

    #[test]
    fn wildcard_detection() {
        assert!(is_wildcard("relay.*"));
        assert!(is_wildcard("relay.>"));
        assert!(!is_wildcard("relay.agent"));
    }

    #[test]
    fn namespace_takes_leading_segments() {
        assert_eq!(namespace("relay.agent.backend.inbox", 3), "relay.agent.backend");
        assert_eq!(namespace("relay.agent", 3), "relay.agent");
        assert_eq!(namespace("relay.agent", 0), "relay");
    }
}
