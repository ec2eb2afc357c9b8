//! Byte-budget truncation on UTF-8 boundaries for result stdout/stderr; the
//! raw streams never leave the worker uncapped.

/// Longest prefix of `input` that fits in `max_len` bytes without splitting
/// a character.
pub fn take_bytes_at_char_boundary(input: &str, max_len: usize) -> &str {
    if input.len() <= max_len {
        return input;
    }
    let mut end = max_len;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Owned variant used when capping a result field in place.
pub fn clip_in_place(text: &mut String, max_len: usize) {
    let keep = take_bytes_at_char_boundary(text, max_len).len();
    text.truncate(keep);
}
