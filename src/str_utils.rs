/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns everything after the first `skip` characters, or `""` when the
/// string is shorter than that.
pub fn skip_chars(s: &str, skip: usize) -> &str {
    if skip == 0 {
        return s;
    }
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

/// Splits `s` into consecutive pieces of at most `size` characters each.
pub fn chunk_chars(s: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    if size == 0 {
        if !s.is_empty() {
            chunks.push(s);
        }
        return chunks;
    }

    let mut rest = s;
    while !rest.is_empty() {
        let head = prefix_chars(rest, size);
        chunks.push(head);
        rest = &rest[head.len()..];
    }
    chunks
}

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}
