//! Read-time unified diff between two snapshot bodies.

use similar::TextDiff;

/// Renders a unified diff with three lines of context.
pub fn unified_diff(from: &str, to: &str, from_label: &str, to_label: &str) -> String {
    TextDiff::from_lines(from, to)
        .unified_diff()
        .context_radius(3)
        .header(from_label, to_label)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_changed_lines() {
        let diff = unified_diff("a\nb\nc\n", "a\nB\nc\n", "x.txt", "x.txt");
        assert!(diff.contains("--- x.txt"));
        assert!(diff.contains("+++ x.txt"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+B"));
    }

    #[test]
    fn empty_baseline_shows_all_additions() {
        let diff = unified_diff("", "line1\nline2\n", "new.txt", "new.txt");
        assert!(diff.contains("+line1"));
        assert!(diff.contains("+line2"));
    }
}
