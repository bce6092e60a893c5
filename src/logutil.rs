//! Logging helpers for radio-supplied strings (node names, port labels, raw capture lines).
//! Remote peers control these values, so they are escaped to keep every log record on one line.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Long strings are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    preview(s, MAX_PREVIEW)
}

/// [`escape_log`] with a caller-chosen character budget.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_control_chars() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd"), "Line1\\nLine2\\r\\tEnd");
        assert_eq!(escape_log("bell\u{7}"), "bell\\x07");
        assert_eq!(escape_log("a\\b"), "a\\\\b");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("ééééé", 3), "ééé…");
        assert_eq!(preview("short", 64), "short");
        assert_eq!(escape_log(&"x".repeat(400)).chars().count(), 301);
    }
}
