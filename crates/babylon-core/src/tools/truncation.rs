//! Output truncation for tool results.
//!
//! Large outputs are cut to a per-context cap. Middle truncation keeps a
//! prefix and suffix around a marker; tail truncation keeps the end (used
//! for test output where recent lines matter most).

/// General tool output cap.
pub const GENERAL_OUTPUT_CAP: usize = 30_000;
/// Search result output cap.
pub const SEARCH_OUTPUT_CAP: usize = 20_000;
/// Directory listing output cap.
pub const LISTING_OUTPUT_CAP: usize = 12_000;
/// Diff block cap inside workspace review.
pub const DIFF_OUTPUT_CAP: usize = 12_000;
/// Test output tail cap inside workspace review.
pub const TEST_OUTPUT_CAP: usize = 3_000;
/// Per-file cap in `read_files`.
pub const READ_FILES_PER_FILE_CAP: usize = 8_000;
/// Batch cap in `read_files`.
pub const READ_FILES_TOTAL_CAP: usize = 25_000;

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

fn ceil_char_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary < text.len() && !text.is_char_boundary(boundary) {
        boundary += 1;
    }
    boundary
}

/// Truncate in the middle, keeping a prefix and a suffix around a marker of
/// the form `[… truncated N characters …]`.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let keep_front = floor_char_boundary(text, max_chars / 2);
    let keep_back = ceil_char_boundary(text, text.len() - (max_chars - keep_front).min(max_chars / 2));
    let dropped = text.len() - keep_front - (text.len() - keep_back);

    format!(
        "{}\n[… truncated {} characters …]\n{}",
        &text[..keep_front],
        dropped,
        &text[keep_back..]
    )
}

/// Keep the tail of the text, marking how much was dropped at the front.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    let start = ceil_char_boundary(text, text.len() - max_chars);
    format!(
        "[… truncated {} characters …]\n{}",
        start,
        &text[start..]
    )
}
