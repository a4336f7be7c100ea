//! Incremental sentence segmentation of a streamed reply

use std::time::{Duration, Instant};

/// Marks that close a clause: ASCII and full-width punctuation plus newline
pub const TERMINATORS: &[char] = &[
    ',', '.', '!', '?', ';', '\n', '，', '。', '！', '？', '；', '、',
];

/// Splits a growing reply into synthesis-ready sentences
///
/// The segmenter owns the accumulated reply text and a consumed offset (the
/// high-water mark of text already handed to synthesis). Each call to
/// [`Segmenter::next_sentence`] yields the earliest complete clause of the
/// unconsumed suffix. If no sentence has been produced within the
/// first-sentence deadline, the whole unconsumed buffer is forced out so
/// synthesis can start.
#[derive(Debug)]
pub struct Segmenter {
    text: String,
    consumed: usize,
    first_fragment_at: Option<Instant>,
    emitted: bool,
    deadline: Duration,
}

impl Segmenter {
    #[must_use]
    pub const fn new(deadline: Duration) -> Self {
        Self {
            text: String::new(),
            consumed: 0,
            first_fragment_at: None,
            emitted: false,
            deadline,
        }
    }

    /// Append a fragment received at `now`
    pub fn push_at(&mut self, fragment: &str, now: Instant) {
        if fragment.is_empty() {
            return;
        }
        self.first_fragment_at.get_or_insert(now);
        self.text.push_str(fragment);
    }

    /// Append a fragment received now
    pub fn push(&mut self, fragment: &str) {
        self.push_at(fragment, Instant::now());
    }

    /// Next complete sentence, evaluating the forced-emission deadline at `now`
    pub fn next_sentence_at(&mut self, now: Instant) -> Option<String> {
        while let Some(end) = self.next_terminator() {
            let clause = self.text[self.consumed..end].trim().to_string();
            self.consumed = end;
            if speakable(&clause) {
                self.emitted = true;
                return Some(clause);
            }
        }

        if self.emitted || !self.deadline_passed(now) {
            return None;
        }

        let rest = self.text[self.consumed..].trim().to_string();
        if !speakable(&rest) {
            return None;
        }
        tracing::debug!(
            chars = rest.chars().count(),
            "no sentence boundary before deadline, forcing sentence"
        );
        self.consumed = self.text.len();
        self.emitted = true;
        Some(rest)
    }

    /// Next complete sentence using the wall clock
    pub fn next_sentence(&mut self) -> Option<String> {
        self.next_sentence_at(Instant::now())
    }

    /// Push a fragment and return the first sentence it completes
    pub fn feed(&mut self, fragment: &str) -> Option<String> {
        self.push(fragment);
        self.next_sentence()
    }

    /// End of stream: every remaining clause, then any unterminated tail
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(end) = self.next_terminator() {
            let clause = self.text[self.consumed..end].trim();
            if speakable(clause) {
                out.push(clause.to_string());
            }
            self.consumed = end;
        }

        let tail = self.text[self.consumed..].trim();
        if speakable(tail) {
            out.push(tail.to_string());
        }
        self.consumed = self.text.len();
        self.emitted |= !out.is_empty();
        out
    }

    /// Accumulated reply text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Byte offset of text already handed out as sentences
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.consumed
    }

    /// Byte offset just past the earliest terminator in the unconsumed text
    fn next_terminator(&self) -> Option<usize> {
        let rest = &self.text[self.consumed..];
        rest.char_indices()
            .find(|(_, c)| TERMINATORS.contains(c))
            .map(|(idx, c)| self.consumed + idx + c.len_utf8())
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.first_fragment_at
            .is_some_and(|first| now.saturating_duration_since(first) > self.deadline)
    }
}

/// A clause made only of whitespace and punctuation has nothing to say
fn speakable(clause: &str) -> bool {
    clause.chars().any(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(1);

    #[test]
    fn emits_clauses_in_order_then_tail_at_end() {
        let mut seg = Segmenter::new(DEADLINE);
        assert_eq!(seg.feed("Hello, world. Bye"), Some("Hello,".to_string()));
        assert_eq!(seg.finish(), vec!["world.".to_string(), "Bye".to_string()]);
    }

    #[test]
    fn drains_every_complete_clause() {
        let mut seg = Segmenter::new(DEADLINE);
        seg.push("One. Two! Three?");
        assert_eq!(seg.next_sentence().as_deref(), Some("One."));
        assert_eq!(seg.next_sentence().as_deref(), Some("Two!"));
        assert_eq!(seg.next_sentence().as_deref(), Some("Three?"));
        assert_eq!(seg.next_sentence(), None);
        assert!(seg.finish().is_empty());
    }

    #[test]
    fn waits_for_terminator_across_fragments() {
        let mut seg = Segmenter::new(DEADLINE);
        assert_eq!(seg.feed("Hel"), None);
        assert_eq!(seg.feed("lo, "), Some("Hello,".to_string()));
        assert_eq!(seg.feed("friend."), Some("friend.".to_string()));
        assert!(seg.finish().is_empty());
        assert_eq!(seg.text(), "Hello, friend.");
    }

    #[test]
    fn handles_full_width_marks() {
        let mut seg = Segmenter::new(DEADLINE);
        seg.push("你好，世界。再见");
        assert_eq!(seg.next_sentence().as_deref(), Some("你好，"));
        assert_eq!(seg.next_sentence().as_deref(), Some("世界。"));
        assert_eq!(seg.finish(), vec!["再见".to_string()]);
    }

    #[test]
    fn never_emits_blank_sentences() {
        let mut seg = Segmenter::new(DEADLINE);
        seg.push(" , .\n\n ! ok");
        assert_eq!(seg.next_sentence(), None);
        assert_eq!(seg.finish(), vec!["ok".to_string()]);

        let mut blank = Segmenter::new(DEADLINE);
        blank.push("\n\n   \n");
        assert_eq!(blank.next_sentence(), None);
        assert!(blank.finish().is_empty());
    }

    #[test]
    fn forces_whole_buffer_after_deadline() {
        let start = Instant::now();
        let mut seg = Segmenter::new(DEADLINE);
        seg.push_at("a long clause without", start);
        assert_eq!(seg.next_sentence_at(start + Duration::from_millis(500)), None);

        seg.push_at(" any marks", start + Duration::from_millis(900));
        let later = start + Duration::from_millis(1100);
        assert_eq!(
            seg.next_sentence_at(later).as_deref(),
            Some("a long clause without any marks")
        );
        assert_eq!(seg.next_sentence_at(later), None);
        assert!(seg.finish().is_empty());
    }

    #[test]
    fn forces_only_once_per_reply() {
        let start = Instant::now();
        let mut seg = Segmenter::new(DEADLINE);
        seg.push_at("first", start);
        let late = start + Duration::from_secs(2);
        assert_eq!(seg.next_sentence_at(late).as_deref(), Some("first"));

        seg.push_at(" second part", late);
        assert_eq!(seg.next_sentence_at(late + Duration::from_secs(2)), None);
        assert_eq!(seg.finish(), vec!["second part".to_string()]);
    }

    #[test]
    fn no_forcing_once_a_sentence_was_emitted() {
        let start = Instant::now();
        let mut seg = Segmenter::new(DEADLINE);
        seg.push_at("Yes. and then", start);
        assert_eq!(seg.next_sentence_at(start).as_deref(), Some("Yes."));
        assert_eq!(seg.next_sentence_at(start + Duration::from_secs(5)), None);
    }

    #[test]
    fn tracks_consumed_offset() {
        let mut seg = Segmenter::new(DEADLINE);
        seg.push("Hi. there");
        assert_eq!(seg.consumed(), 0);
        seg.next_sentence();
        assert_eq!(seg.consumed(), 3);
        seg.finish();
        assert_eq!(seg.consumed(), seg.text().len());
    }
}
