use std::collections::VecDeque;

use anyhow::{bail, Error};

/// Maximum length of a content line in octets, excluding the line break.
const MAX_LINE_OCTETS: usize = 75;

/// Escape a TEXT value so it can be used as a property value.
pub fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            ';' => escaped.push_str("\\;"),
            ',' => escaped.push_str("\\,"),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            c => escaped.push(c),
        }
    }

    escaped
}

/// Unescape string.
pub fn unescape(s: &str) -> Result<String, Error> {
    let mut queue: VecDeque<_> = s.chars().collect();
    let mut s = String::new();

    while let Some(c) = queue.pop_front() {
        if c != '\\' {
            s.push(c);
            continue;
        }

        match queue.pop_front() {
            Some('n') => s.push('\n'),
            Some('N') => s.push('\n'),
            Some('\\') => s.push('\\'),
            Some(';') => s.push(';'),
            Some(',') => s.push(','),
            Some(c) => bail!("Unexpected escape sequence \\{}", c),
            None => bail!("String ends up in \\"),
        };
    }

    Ok(s)
}

/// Fold a content line so that no physical line is longer than 75 octets.
///
/// Continuation lines start with a single space, which counts towards their
/// length. UTF-8 sequences are never split. The returned string does not end
/// in a line break.
pub fn fold_line(line: &str) -> String {
    if line.len() <= MAX_LINE_OCTETS {
        return line.to_string();
    }

    let mut folded = String::with_capacity(line.len() + line.len() / MAX_LINE_OCTETS * 3);
    let mut used = 0;

    for c in line.chars() {
        let width = c.len_utf8();
        if used + width > MAX_LINE_OCTETS {
            folded.push_str("\r\n ");
            used = 1;
        }
        folded.push(c);
        used += width;
    }

    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(
            escape("Room 1; Block A, Floor 2\\3\nNote"),
            "Room 1\\; Block A\\, Floor 2\\\\3\\nNote"
        );
    }

    #[test]
    fn test_unescape_reverses_escape() {
        let original = "Lab, Room 4; bring laptop\\charger\nsecond line";
        assert_eq!(unescape(&escape(original)).unwrap(), original);
    }

    #[test]
    fn test_unescape_rejects_bad_sequences() {
        assert!(unescape("bad \\q").is_err());
        assert!(unescape("trailing \\").is_err());
    }

    #[test]
    fn test_fold_short_line_untouched() {
        assert_eq!(fold_line("SUMMARY:Short"), "SUMMARY:Short");

        let exact = "X".repeat(75);
        assert_eq!(fold_line(&exact), exact);
    }

    #[test]
    fn test_fold_long_line() {
        let line = format!("DESCRIPTION:{}", "a".repeat(200));
        let folded = fold_line(&line);

        for physical in folded.split("\r\n") {
            assert!(physical.len() <= 75, "line too long: {}", physical.len());
        }

        assert_eq!(folded.replace("\r\n ", ""), line);
    }

    #[test]
    fn test_fold_keeps_utf8_sequences() {
        let line = format!("LOCATION:{}", "教學樓".repeat(20));
        let folded = fold_line(&line);

        for physical in folded.split("\r\n") {
            assert!(physical.len() <= 75);
        }

        assert_eq!(folded.replace("\r\n ", ""), line);
    }
}
