//! Bounded text helpers.
//!
//! Error strings coming back from the action runtime can be arbitrarily
//! large (stack traces, command output). Middle-omission keeps both the
//! start of the message and its final lines, which usually carry the cause.

/// Truncate `text` to at most `max_chars` characters using middle-omission.
///
/// The omission marker is counted against the budget, so the result never
/// exceeds `max_chars` characters. Budgets too small to hold the marker fall
/// back to a plain head cut. Splitting is done on characters, never bytes.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_owned();
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total <= max_chars {
        return text.to_owned();
    }

    // The marker's own length depends on the digit count of `omitted`;
    // settle it before cutting.
    let mut omitted = total - max_chars;
    let mut marker = omission_marker(omitted);
    for _ in 0..3 {
        let marker_len = marker.chars().count();
        if max_chars < marker_len + 2 {
            return chars[..max_chars].iter().collect();
        }
        let settled = total - (max_chars - marker_len);
        if settled == omitted {
            break;
        }
        omitted = settled;
        marker = omission_marker(omitted);
    }

    let marker_len = marker.chars().count();
    if max_chars < marker_len + 2 {
        return chars[..max_chars].iter().collect();
    }

    let keep = max_chars - marker_len;
    let head_len = keep.div_ceil(2);
    let tail_len = keep - head_len;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[total - tail_len..].iter().collect();

    format!("{head}{marker}{tail}")
}

fn omission_marker(omitted: usize) -> String {
    format!(" ... [{omitted} chars omitted] ... ")
}
