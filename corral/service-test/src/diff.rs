/// Normalizes captured output for comparison: stdout must equal `output`
/// after trimming blank lines and whitespace. Each line is right/left-
/// trimmed and blank lines are dropped entirely,
/// so incidental trailing whitespace or an extra blank line at the end of
/// a fixture doesn't fail a match that's otherwise correct.
pub fn normalize(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compares captured stdout against the fixture's expected output under
/// [`normalize`]. `None` on the expected side always matches (a command
/// with no `output` fixture isn't checked).
pub fn matches(expected: Option<&str>, actual: &str) -> bool {
    match expected {
        None => true,
        Some(expected) => normalize(expected) == normalize(actual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_leading_and_trailing_blank_lines() {
        assert!(matches(Some("\n\npong\n\n"), "pong\n"));
    }

    #[test]
    fn ignores_incidental_whitespace_per_line() {
        assert!(matches(Some("pong"), "  pong  \n"));
    }

    #[test]
    fn detects_a_real_mismatch() {
        assert!(!matches(Some("pong"), "ping"));
    }

    #[test]
    fn no_expectation_always_matches() {
        assert!(matches(None, "anything at all"));
    }

    #[test]
    fn drops_interior_blank_lines_consistently_on_both_sides() {
        assert!(matches(Some("a\n\nb"), "a\nb\n"));
    }
}
