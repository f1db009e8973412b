use super::types::{Chunk, LoadedDocument, content_hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters repeated at the start of the next chunk.
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 300,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid splitter config: chunk_size={chunk_size}, chunk_overlap={chunk_overlap} (need 0 <= overlap < size)")]
pub struct SplitterConfigError {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone)]
pub struct TextSplitter {
    config: SplitterConfig,
}

impl TextSplitter {
    /// # Errors
    ///
    /// Returns [`SplitterConfigError`] when `chunk_size` is zero or the overlap is not smaller than it.
    pub fn try_new(config: SplitterConfig) -> Result<Self, SplitterConfigError> {
        if config.chunk_size == 0 || config.chunk_overlap >= config.chunk_size {
            return Err(SplitterConfigError {
                chunk_size: config.chunk_size,
                chunk_overlap: config.chunk_overlap,
            });
        }
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> SplitterConfig {
        self.config
    }

    /// Split a loaded document page by page. Pages with no text contribute no chunks;
    /// `chunk_index` runs across the whole document.
    #[must_use]
    pub fn split(&self, document: &LoadedDocument) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (page_idx, page) in document.pages.iter().enumerate() {
            if page.trim().is_empty() {
                continue;
            }
            for text in self.split_text(page) {
                chunks.push(Chunk {
                    content_hash: content_hash(&text),
                    chunk_index: chunks.len(),
                    page: page_idx + 1,
                    text,
                });
            }
        }
        chunks
    }

    /// Lazily split `text` into trimmed, non-empty chunks.
    pub fn split_text(&self, text: &str) -> impl Iterator<Item = String> {
        let mut spans = Spans::new(text.chars().collect(), self.config);
        std::iter::from_fn(move || {
            loop {
                let (start, end) = spans.next_span()?;
                let piece: String = spans.chars[start..end].iter().collect();
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_owned());
                }
            }
        })
    }

    /// Raw `(start, end)` character ranges before trimming.
    #[cfg(test)]
    pub(crate) fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Spans::new(text.chars().collect(), self.config);
        std::iter::from_fn(|| spans.next_span()).collect()
    }
}

/// Cursor over the character ranges of one text.
///
/// Every step moves `start` forward by at least `max(1, chunk_size / 4)`, so the
/// number of steps is bounded by `4 * len / chunk_size + 1`.
struct Spans {
    chars: Vec<char>,
    start: usize,
    size: usize,
    overlap: usize,
    min_advance: usize,
    done: bool,
}

impl Spans {
    fn new(chars: Vec<char>, config: SplitterConfig) -> Self {
        Self {
            done: chars.is_empty(),
            chars,
            start: 0,
            size: config.chunk_size,
            overlap: config.chunk_overlap,
            min_advance: (config.chunk_size / 4).max(1),
        }
    }

    fn next_span(&mut self) -> Option<(usize, usize)> {
        if self.done {
            return None;
        }
        let len = self.chars.len();
        let start = self.start;
        if len - start <= self.size {
            self.done = true;
            return Some((start, len));
        }
        let window_end = start + self.size;
        let floor = start + self.min_advance;
        let cut = find_cut(&self.chars, floor, window_end).unwrap_or(window_end);

        let next = snap_to_word_start(&self.chars, cut.saturating_sub(self.overlap), floor);
        self.start = next.clamp(floor, cut);
        Some((start, cut))
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    SentenceEnd,
    BlankLine,
    LineBreak,
    Space,
}

impl Boundary {
    const PRIORITY: [Self; 4] = [
        Self::SentenceEnd,
        Self::BlankLine,
        Self::LineBreak,
        Self::Space,
    ];

    /// Whether a cut just before index `at` ends on this boundary.
    fn matches(self, chars: &[char], at: usize) -> bool {
        let prev = chars[at - 1];
        match self {
            Self::SentenceEnd => {
                matches!(prev, '.' | '!' | '?')
                    && chars.get(at).is_none_or(|c| c.is_whitespace())
            }
            Self::BlankLine => prev == '\n' && at >= 2 && chars[at - 2] == '\n',
            Self::LineBreak => prev == '\n',
            Self::Space => prev.is_whitespace(),
        }
    }
}

/// Scan back from `window_end` to `floor` for the best boundary, trying marker kinds
/// in priority order.
fn find_cut(chars: &[char], floor: usize, window_end: usize) -> Option<usize> {
    let floor = floor.max(1);
    Boundary::PRIORITY.iter().find_map(|kind| {
        (floor..=window_end)
            .rev()
            .find(|&at| kind.matches(chars, at))
    })
}

/// Move `at` back to the start of the word it falls inside, never below `floor`.
fn snap_to_word_start(chars: &[char], at: usize, floor: usize) -> usize {
    let inside_word = |i: usize| {
        i > 0 && i < chars.len() && !chars[i - 1].is_whitespace() && !chars[i].is_whitespace()
    };
    if at <= floor || !inside_word(at) {
        return at;
    }
    let mut i = at;
    while i > floor && inside_word(i) {
        i -= 1;
    }
    if inside_word(i) { at } else { i }
}
