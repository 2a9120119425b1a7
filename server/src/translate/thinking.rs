//! Detection of literal `<thinking>`/`</thinking>` tags in upstream text,
//! including tags split across chunk boundaries.

/// Length of the longest proper prefix of `tag` that is also a suffix of
/// `buffer`. The scanner holds that many bytes back until the next chunk
/// decides whether the tag completes.
pub fn pending_tag_suffix(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

pub const THINK_OPEN: &str = "<thinking>";
pub const THINK_CLOSE: &str = "</thinking>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Text,
    Thinking,
}

/// A maximal run of same-kind content with the tags stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub kind: RunKind,
    pub text: String,
}

/// Incremental tag scanner. `push` consumes one upstream chunk and emits
/// the runs that are certainly text or certainly thinking; a partial tag
/// at the chunk edge stays held until more input arrives.
#[derive(Debug, Default)]
pub struct ThinkScanner {
    in_think: bool,
    held: String,
}

impl ThinkScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Run> {
        self.held.push_str(chunk);
        let mut runs = Vec::new();
        loop {
            let (tag, kind) = if self.in_think {
                (THINK_CLOSE, RunKind::Thinking)
            } else {
                (THINK_OPEN, RunKind::Text)
            };
            if let Some(i) = self.held.find(tag) {
                if i > 0 {
                    runs.push(Run {
                        kind,
                        text: self.held[..i].to_string(),
                    });
                }
                self.held.drain(..i + tag.len());
                self.in_think = !self.in_think;
            } else {
                let hold = pending_tag_suffix(&self.held, tag);
                let emit = self.held.len() - hold;
                if emit > 0 {
                    runs.push(Run {
                        kind,
                        text: self.held[..emit].to_string(),
                    });
                    self.held.drain(..emit);
                }
                break;
            }
        }
        runs
    }

    /// Flush whatever is still held. A partial tag that never completed
    /// was ordinary text after all.
    pub fn finish(&mut self) -> Option<Run> {
        if self.held.is_empty() {
            return None;
        }
        let kind = if self.in_think {
            RunKind::Thinking
        } else {
            RunKind::Text
        };
        Some(Run {
            kind,
            text: std::mem::take(&mut self.held),
        })
    }

    pub fn in_thinking(&self) -> bool {
        self.in_think
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Run {
        Run {
            kind: RunKind::Text,
            text: s.to_string(),
        }
    }

    fn thinking(s: &str) -> Run {
        Run {
            kind: RunKind::Thinking,
            text: s.to_string(),
        }
    }

    #[test]
    fn pending_suffix_lengths() {
        assert_eq!(pending_tag_suffix("Hello <thi", THINK_OPEN), 4);
        assert_eq!(pending_tag_suffix("Hello <", THINK_OPEN), 1);
        assert_eq!(pending_tag_suffix("Hello", THINK_OPEN), 0);
        // a complete tag is not a proper prefix
        assert_eq!(pending_tag_suffix("<thinking>", THINK_OPEN), 0);
        assert_eq!(pending_tag_suffix("x</thinkin", THINK_CLOSE), 9);
    }

    #[test]
    fn single_chunk_with_tags() {
        let mut scanner = ThinkScanner::new();
        let runs = scanner.push("a<thinking>b</thinking>c");
        assert_eq!(runs, vec![text("a"), thinking("b"), text("c")]);
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn tag_split_across_chunks() {
        let mut scanner = ThinkScanner::new();
        let mut runs = scanner.push("Hello <thi");
        runs.extend(scanner.push("nking>secret</thinking> world"));
        assert_eq!(
            runs,
            vec![text("Hello "), thinking("secret"), text(" world")]
        );
        // no literal tag bytes in any run
        for run in &runs {
            assert!(!run.text.contains('<'));
            assert!(!run.text.contains('>'));
        }
    }

    #[test]
    fn one_byte_chunks() {
        let mut scanner = ThinkScanner::new();
        let mut runs = Vec::new();
        for c in "x<thinking>yz</thinking>w".chars() {
            runs.extend(scanner.push(&c.to_string()));
        }
        runs.extend(scanner.finish());
        let joined_text: String = runs
            .iter()
            .filter(|r| r.kind == RunKind::Text)
            .map(|r| r.text.as_str())
            .collect();
        let joined_thinking: String = runs
            .iter()
            .filter(|r| r.kind == RunKind::Thinking)
            .map(|r| r.text.as_str())
            .collect();
        assert_eq!(joined_text, "xw");
        assert_eq!(joined_thinking, "yz");
    }

    #[test]
    fn unfinished_partial_tag_flushes_as_text() {
        let mut scanner = ThinkScanner::new();
        let runs = scanner.push("done <thi");
        assert_eq!(runs, vec![text("done ")]);
        assert_eq!(scanner.finish(), Some(text("<thi")));
    }

    #[test]
    fn close_tag_split_across_chunks() {
        let mut scanner = ThinkScanner::new();
        let mut runs = scanner.push("<thinking>deep</thi");
        runs.extend(scanner.push("nking>done"));
        assert_eq!(runs, vec![thinking("deep"), text("done")]);
    }

    #[test]
    fn angle_bracket_that_is_not_a_tag_passes_through() {
        let mut scanner = ThinkScanner::new();
        let mut runs = scanner.push("a < b and a <t");
        runs.extend(scanner.push("ypo> done"));
        let joined: String = runs.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(joined, "a < b and a <typo> done");
        assert!(runs.iter().all(|r| r.kind == RunKind::Text));
    }
}
