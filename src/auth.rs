//! Bearer token checks for the HTTP query surface.
//!
//! Provides constant-time token comparison and bearer header extraction.

/// Validates a provided token against the expected token using constant-time comparison.
///
/// Returns `false` if either token is empty.
pub fn validate_token(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.is_empty() || expected.is_empty() {
        return false;
    }

    let len_match = provided.len() == expected.len();

    // XOR accumulator: if any byte differs, result will be non-zero
    let mut diff: u8 = 0;
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }

    len_match && diff == 0
}

/// Extracts the bearer token from an Authorization header value.
///
/// Expected format: "Bearer <token>" (prefix is case-insensitive, RFC 6750).
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();

    if header.len() < 7 || !header.is_char_boundary(7) {
        return None;
    }

    let (prefix, token) = header.split_at(7);
    if prefix.eq_ignore_ascii_case("Bearer ") {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    } else {
        None
    }
}

/// Checks an optional Authorization header against the configured token.
///
/// When no token is configured every request is allowed.
pub fn is_authorized(header: Option<&str>, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => header
            .and_then(extract_bearer_token)
            .map(|token| validate_token(token, expected))
            .unwrap_or(false),
    }
}
