//! Smart split: where to break long output into platform messages.
//!
//! Lengths are in characters; returned offsets are byte offsets into the
//! input and always fall on a char boundary.

const FENCE: &str = "```";

/// Sentence terminators that end a sentence without trailing whitespace.
const CJK_TERMINATORS: &[char] = &['。', '！', '？'];

/// Choose the byte offset at which to cut `text` so the head fits `ceiling`
/// characters.
///
/// Inside an open code fence the cut moves forward to the next line break
/// within `lookahead` characters (or stays at the ceiling). A `lookahead` of
/// zero forbids the overshoot: the cut falls back to the last line break
/// inside the ceiling, or the ceiling itself. Outside a fence
/// the preference is: last paragraph break at or past 70% of the ceiling,
/// last sentence end, last whitespace, the ceiling itself. Returns
/// `text.len()` when the text already fits.
pub fn smart_split(text: &str, ceiling: usize, lookahead: usize) -> usize {
    split_point(text, ceiling, lookahead, false)
}

/// [`smart_split`] for text that continues a message which left a fence
/// open (`fence_open` = the text starts inside a code block).
pub fn split_point(text: &str, ceiling: usize, lookahead: usize, fence_open: bool) -> usize {
    let ceiling = ceiling.max(1);
    let Some(limit) = byte_at_char(text, ceiling) else {
        return text.len();
    };

    let head = &text[..limit];
    if inside_fence(head) != fence_open {
        if lookahead == 0 {
            return match head.rfind('\n') {
                Some(p) => p + 1,
                None => limit,
            };
        }
        let window_end = byte_at_char(&text[limit..], lookahead)
            .map(|b| limit + b)
            .unwrap_or(text.len());
        return match text[limit..window_end].find('\n') {
            Some(p) => limit + p + 1,
            None => limit,
        };
    }

    let floor = byte_at_char(text, ceiling * 7 / 10).unwrap_or(0);
    if let Some(p) = head.rfind("\n\n") {
        if p >= floor {
            return p + 2;
        }
    }

    if let Some(cut) = last_sentence_end(head) {
        return cut;
    }

    if let Some((i, c)) = head.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        let cut = i + c.len_utf8();
        if cut > 0 {
            return cut;
        }
    }

    limit
}

/// Break `text` into pieces of at most `ceiling` characters. One piece may
/// run up to `lookahead` past it to finish a code line; later fence splits
/// stay inside the ceiling.
pub fn split_message(text: &str, ceiling: usize, lookahead: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    let mut fence_open = false;
    let mut overshot = false;
    while !rest.is_empty() {
        let allowance = if overshot { 0 } else { lookahead };
        let cut = split_point(rest, ceiling, allowance, fence_open);
        let (piece, tail) = rest.split_at(cut);
        fence_open ^= inside_fence(piece);
        overshot |= piece.chars().count() > ceiling;
        pieces.push(piece.to_string());
        rest = tail;
    }
    pieces
}

/// Whether `text` ends inside a fenced code block (odd count of unescaped
/// triple backticks).
pub fn inside_fence(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut count = 0usize;
    let mut from = 0usize;
    while let Some(p) = text[from..].find(FENCE) {
        let at = from + p;
        if at == 0 || bytes[at - 1] != b'\\' {
            count += 1;
        }
        from = at + FENCE.len();
    }
    count % 2 == 1
}

/// Byte offset of the `n`th char, `None` when `text` has `n` chars or fewer.
fn byte_at_char(text: &str, n: usize) -> Option<usize> {
    text.char_indices().nth(n).map(|(i, _)| i)
}

/// Cut point just past the last sentence terminator in `head`.
fn last_sentence_end(head: &str) -> Option<usize> {
    let mut next: Option<(usize, char)> = None;
    for (i, c) in head.char_indices().rev() {
        if CJK_TERMINATORS.contains(&c) {
            return Some(i + c.len_utf8());
        }
        if matches!(c, '.' | '!' | '?') {
            if let Some((j, w)) = next {
                if w.is_whitespace() {
                    return Some(j + w.len_utf8());
                }
            }
        }
        next = Some((i, c));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_not_split() {
        assert_eq!(smart_split("hello", 10, 5), 5);
        assert_eq!(smart_split("exactly10!", 10, 5), 10);
    }

    #[test]
    fn paragraph_break_past_seventy_percent_wins() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(50));
        let cut = smart_split(&text, 100, 10);
        assert_eq!(cut, 82);
        assert!(cut >= 70);
        assert!(text[cut..].starts_with('b'));
    }

    #[test]
    fn early_paragraph_break_falls_back_to_sentence() {
        let text = format!("{}\n\n{}. {}", "a".repeat(10), "b".repeat(60), "c".repeat(60));
        let cut = smart_split(&text, 100, 10);
        assert_eq!(&text[cut - 2..cut], ". ");
    }

    #[test]
    fn whitespace_then_hard_cut() {
        let text = format!("{} {}", "a".repeat(50), "b".repeat(100));
        assert_eq!(smart_split(&text, 100, 10), 51);
        let solid = "x".repeat(150);
        assert_eq!(smart_split(&solid, 100, 10), 100);
    }

    #[test]
    fn cjk_terminator_splits_without_space() {
        let text = "你好。".repeat(40);
        let cut = smart_split(&text, 10, 5);
        assert!(text[..cut].ends_with('。'));
        assert!(text[..cut].chars().count() <= 10);
    }

    #[test]
    fn open_fence_defers_to_next_newline() {
        let mut text = String::from("Here:\n```rust\n");
        while text.chars().count() < 98 {
            text.push_str("let x = 1;\n");
        }
        text.push_str("let tail_of_a_long_line = 42;\nmore\n```\n");
        let ceiling = 100;
        let cut = smart_split(&text, ceiling, 40);
        assert!(cut > ceiling);
        assert_eq!(&text[cut - 1..cut], "\n");
        assert!(inside_fence(&text[..ceiling]));
    }

    #[test]
    fn open_fence_without_newline_cuts_at_ceiling() {
        let text = format!("```\n{}", "y".repeat(200));
        assert_eq!(smart_split(&text, 100, 20), 100);
    }

    #[test]
    fn only_one_piece_overshoots_a_long_fence() {
        let mut text = String::from("```\n");
        for i in 0..40 {
            text.push_str(&format!("let value_{i:02} = compute({i});\n"));
        }
        text.push_str("```\n");

        let pieces = split_message(&text, 100, 40);
        let oversized = pieces.iter().filter(|p| p.chars().count() > 100).count();
        assert!(pieces.len() > 3);
        assert!(oversized <= 1, "oversized pieces: {oversized}");
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn zero_lookahead_cuts_at_last_line_inside_fence() {
        let text = format!("```\n{}\n{}", "a".repeat(50), "b".repeat(100));
        assert_eq!(split_point(&text, 100, 0, false), 55);
        let solid = format!("```{}", "c".repeat(200));
        assert_eq!(split_point(&solid, 100, 0, false), 100);
    }

    #[test]
    fn escaped_backticks_do_not_open_a_fence() {
        assert!(!inside_fence(r"text \``` more"));
        assert!(inside_fence("```py\ncode"));
        assert!(!inside_fence("```py\ncode\n```"));
    }

    #[test]
    fn unterminated_fence_never_cut_inside_a_line() {
        let mut text = String::from("```\n");
        for i in 0..60 {
            text.push_str(&format!("line {i:02} of code\n"));
        }
        for piece in split_message(&text, 100, 40) {
            assert!(piece.ends_with('\n'), "piece cut mid-line: {piece:?}");
        }
    }

    #[test]
    fn split_message_reassembles() {
        let text = "One sentence. Another one! A third? ".repeat(20);
        let pieces = split_message(&text, 50, 10);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| p.chars().count() <= 50));
    }
}
