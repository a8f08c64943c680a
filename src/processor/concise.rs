use serde::{Deserialize, Serialize};

const ELLIPSIS: &str = "...";

/// Bounds applied to every assistant reply before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcisePolicy {
    pub max_lines: usize,
    pub max_chars: usize,
}

impl Default for ConcisePolicy {
    fn default() -> Self {
        Self {
            max_lines: 4,
            max_chars: 200,
        }
    }
}

impl ConcisePolicy {
    /// Trims each line and drops blank ones, keeps at most `max_lines` (the
    /// last kept line gets a closing `.` when lines were cut), then caps the
    /// result at `max_chars` characters ending in `...`.
    pub fn apply(&self, reply: &str) -> String {
        let mut lines: Vec<String> = reply
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if self.max_lines > 0 && lines.len() > self.max_lines {
            lines.truncate(self.max_lines);
            if let Some(last) = lines.last_mut() {
                if !last.ends_with('.') {
                    last.push('.');
                }
            }
        }

        let joined = lines.join("\n");
        if self.max_chars == 0 || joined.chars().count() <= self.max_chars {
            return joined;
        }
        let keep = self.max_chars.saturating_sub(ELLIPSIS.len());
        let mut truncated: String = joined.chars().take(keep).collect();
        truncated.push_str(ELLIPSIS);
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_replies_are_only_trimmed() {
        let policy = ConcisePolicy::default();
        assert_eq!(policy.apply("  Hi there  \n\n"), "Hi there");
        assert_eq!(policy.apply("one\n   \ntwo"), "one\ntwo");
    }

    #[test]
    fn extra_lines_are_dropped_and_closed() {
        let policy = ConcisePolicy::default();
        let reply = policy.apply("a\nb\nc\nd\ne\nf");
        assert_eq!(reply, "a\nb\nc\nd.");

        let already_closed = policy.apply("a\nb\nc\nd.\ne");
        assert_eq!(already_closed, "a\nb\nc\nd.");
    }

    #[test]
    fn long_replies_are_cut_with_an_ellipsis() {
        let policy = ConcisePolicy::default();
        let reply = policy.apply(&"x".repeat(250));
        assert_eq!(reply.chars().count(), 200);
        assert!(reply.ends_with("..."));
        assert_eq!(policy.apply(&"y".repeat(200)), "y".repeat(200));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let policy = ConcisePolicy {
            max_lines: 4,
            max_chars: 5,
        };
        assert_eq!(policy.apply("héllöwörld"), "hé...");
    }
}
