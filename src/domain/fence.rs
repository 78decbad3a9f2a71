//! Repairs code-fence language annotations before markdown conversion.
//!
//! Syntax highlighters downstream reject empty or meaningless language tags,
//! so every opening fence leaves this pass with a usable token. Closing
//! fences and fence content are never touched.

/// Token substituted for missing or meaningless info strings.
pub const FALLBACK_LANGUAGE: &str = "text";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FenceState {
    marker: u8,
    marker_len: usize,
}

struct FenceLine<'a> {
    indent: &'a str,
    marker: u8,
    marker_len: usize,
    rest: &'a str,
}

/// Normalize the info string of every opening fence in `markdown`.
///
/// Lines keep their original terminators (LF or CRLF). The function is total
/// and idempotent.
pub fn normalize_fences(markdown: &str) -> String {
    let mut output = String::with_capacity(markdown.len() + 16);
    let mut state: Option<FenceState> = None;

    for raw_line in markdown.split_inclusive('\n') {
        let (content, terminator) = split_terminator(raw_line);

        let Some(fence) = parse_fence_line(content) else {
            output.push_str(raw_line);
            continue;
        };

        match state {
            Some(open) => {
                if open.marker == fence.marker
                    && fence.marker_len >= open.marker_len
                    && fence.rest.trim().is_empty()
                {
                    state = None;
                }
                output.push_str(raw_line);
            }
            None => {
                state = Some(FenceState {
                    marker: fence.marker,
                    marker_len: fence.marker_len,
                });
                output.push_str(fence.indent);
                output.push_str(&content[fence.indent.len()..fence.indent.len() + fence.marker_len]);
                output.push(' ');
                output.push_str(&language_token(fence.rest));
                output.push_str(terminator);
            }
        }
    }

    output
}

/// Resolve the token written after an opening fence marker.
pub fn language_token(info: &str) -> String {
    let trimmed = info.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("undefined")
        || trimmed.eq_ignore_ascii_case("null")
        || !trimmed.chars().any(is_language_char)
    {
        return FALLBACK_LANGUAGE.to_string();
    }
    trimmed.to_string()
}

pub(crate) fn is_language_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(stripped) = line.strip_suffix("\r\n") {
        (stripped, &line[stripped.len()..])
    } else if let Some(stripped) = line.strip_suffix('\n') {
        (stripped, &line[stripped.len()..])
    } else {
        (line, "")
    }
}

fn parse_fence_line(line: &str) -> Option<FenceLine<'_>> {
    let indent_len = line.bytes().take_while(|byte| *byte == b' ').count();
    if indent_len > 3 {
        return None;
    }
    let (indent, trimmed) = line.split_at(indent_len);
    let first = *trimmed.as_bytes().first()?;
    if first != b'`' && first != b'~' {
        return None;
    }
    let marker_len = trimmed.bytes().take_while(|byte| *byte == first).count();
    if marker_len < 3 {
        return None;
    }
    let rest = &trimmed[marker_len..];
    // A backtick run followed by more backticks is inline code, not a fence.
    if first == b'`' && rest.contains('`') {
        return None;
    }
    Some(FenceLine {
        indent,
        marker: first,
        marker_len,
        rest,
    })
}
