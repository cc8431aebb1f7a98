use std::collections::VecDeque;
use std::ops::Range;

const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", ", ", " "];

/// Span of one chunk within its page, in characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ChunkSpan {
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
}

/// Splits page text into chunks of at most `chunk_size` characters, preferring
/// paragraph, line, sentence, clause and word boundaries in that order.
/// Consecutive chunks share up to `chunk_overlap` characters of whole pieces.
pub(super) fn split_page(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<ChunkSpan> {
    let chunk_size = chunk_size.max(1);
    let mut pieces = Vec::new();
    collect_pieces(text, 0, chunk_size, &SEPARATORS, &mut pieces);

    let mut spans = Vec::new();
    let mut window = VecDeque::<Range<usize>>::new();
    let mut window_len = 0_usize;

    for piece in pieces {
        let piece_len = char_len(&text[piece.clone()]);
        if window_len + piece_len > chunk_size && !window.is_empty() {
            push_span(text, &window, &mut spans);
            while let Some(front) = window.front() {
                if window_len > chunk_overlap || window_len + piece_len > chunk_size {
                    window_len -= char_len(&text[front.clone()]);
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        window_len += piece_len;
        window.push_back(piece);
    }
    push_span(text, &window, &mut spans);

    spans
}

fn collect_pieces(
    text: &str,
    base: usize,
    max_chars: usize,
    separators: &[&str],
    out: &mut Vec<Range<usize>>,
) {
    if text.is_empty() {
        return;
    }
    if char_len(text) <= max_chars {
        out.push(base..base + text.len());
        return;
    }

    let Some((separator, rest)) = separators.split_first() else {
        let mut start = 0;
        let mut count = 0;
        for (index, _) in text.char_indices() {
            if count == max_chars {
                out.push(base + start..base + index);
                start = index;
                count = 0;
            }
            count += 1;
        }
        out.push(base + start..base + text.len());
        return;
    };

    let mut start = 0;
    for (index, matched) in text.match_indices(separator) {
        let end = index + matched.len();
        collect_pieces(&text[start..end], base + start, max_chars, rest, out);
        start = end;
    }
    collect_pieces(&text[start..], base + start, max_chars, rest, out);
}

fn push_span(text: &str, window: &VecDeque<Range<usize>>, spans: &mut Vec<ChunkSpan>) {
    let (Some(first), Some(last)) = (window.front(), window.back()) else {
        return;
    };
    let raw = &text[first.start..last.end];
    if raw.trim().is_empty() {
        return;
    }
    let char_start = char_len(&text[..first.start]);
    spans.push(ChunkSpan {
        text: raw.trim().to_string(),
        char_start,
        char_end: char_start + char_len(raw),
    });
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
