//! Locating tool-call markers and isolating the fragment after each one.

use regex_lite::Regex;

use crate::repair::top_level_end;

const CLOSE_TAG: &str = "</tool_call>";

/// One marker occurrence in a reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    /// Byte range to remove from the reply (marker through fragment end).
    pub span: (usize, usize),
    /// The isolated fragment, `None` when the marker was not followed by
    /// an object.
    pub fragment: Option<String>,
    /// Found by the bare-object fallback rather than a marker.
    pub bare: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Marker {
    /// `TOOL_CALL:` (any case, optional space before the colon)
    Prefix,
    /// `<tool_call>` (any case)
    Tag,
}

/// Scan `text` for markers and isolate one candidate per marker, in
/// document order. When no marker is present, bare `{"name": ...}`
/// objects matched by `bare_object` are used instead.
pub(crate) fn candidates(text: &str, bare_object: Option<&Regex>) -> Vec<Candidate> {
    let markers = find_markers(text);

    if markers.is_empty() {
        let Some(re) = bare_object else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut from = 0;
        while let Some(m) = re.find_at(text, from) {
            let end = fragment_end(text, m.start(), &[]);
            out.push(Candidate {
                span: (m.start(), end),
                fragment: Some(text[m.start()..end].trim_end().to_string()),
                bare: true,
            });
            from = end.max(m.end());
        }
        return out;
    }

    let starts: Vec<usize> = markers.iter().map(|(start, _, _)| *start).collect();
    let mut out = Vec::new();
    let mut consumed = 0;

    for &(start, after, kind) in &markers {
        if start < consumed {
            // Marker text inside a previous fragment.
            continue;
        }
        let later: Vec<usize> = starts.iter().copied().filter(|s| *s > start).collect();
        let candidate = isolate(text, start, after, kind, &later);
        consumed = candidate.span.1;
        out.push(candidate);
    }
    out
}

/// All markers as `(start, end_of_marker, kind)`.
fn find_markers(text: &str) -> Vec<(usize, usize, Marker)> {
    // ASCII lowering keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let needle = "tool_call";
    let mut out = Vec::new();
    let mut from = 0;

    while let Some(pos) = lower[from..].find(needle) {
        let idx = from + pos;
        let end = idx + needle.len();
        from = end;

        let before = idx.checked_sub(1).map(|i| bytes[i]);
        if before == Some(b'<') && bytes.get(end) == Some(&b'>') {
            out.push((idx - 1, end + 1, Marker::Tag));
            continue;
        }
        if matches!(before, Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'<' || b == b'/')
        {
            continue;
        }
        let mut j = end;
        while bytes.get(j).is_some_and(|b| *b == b' ' || *b == b'\t') {
            j += 1;
        }
        if bytes.get(j) == Some(&b':') {
            out.push((idx, j + 1, Marker::Prefix));
        }
    }
    out
}

fn isolate(text: &str, start: usize, after: usize, kind: Marker, later: &[usize]) -> Candidate {
    let close_tag = match kind {
        Marker::Tag => text[after..]
            .to_ascii_lowercase()
            .find(CLOSE_TAG)
            .map(|i| after + i)
            .filter(|close| later.first().is_none_or(|next| close < next)),
        Marker::Prefix => None,
    };

    let region_end = close_tag.unwrap_or(text.len());
    let body_start = skip_fence(text, after, region_end);

    if !text[body_start..region_end].trim_start().starts_with('{') {
        let end = close_tag.map_or(line_end(text, after), |c| c + CLOSE_TAG.len());
        return Candidate {
            span: (start, end),
            fragment: None,
            bare: false,
        };
    }
    let object_start = body_start + (text[body_start..].len() - text[body_start..].trim_start().len());

    if let Some(close) = close_tag {
        let inner = strip_closing_fence(text[object_start..close].trim());
        return Candidate {
            span: (start, close + CLOSE_TAG.len()),
            fragment: Some(inner.to_string()),
            bare: false,
        };
    }

    let end = fragment_end(text, object_start, later);
    Candidate {
        span: (start, end),
        fragment: Some(text[object_start..end].trim_end().to_string()),
        bare: false,
    }
}

/// End of the fragment starting at `object_start`: the close of the
/// top-level object when it balances, otherwise the first of the next
/// marker, a closing tag, a blank line, a line that cannot continue a
/// JSON value, or the end of the text.
fn fragment_end(text: &str, object_start: usize, later: &[usize]) -> usize {
    let rest = &text[object_start..];
    if let Some(len) = top_level_end(rest) {
        return object_start + len;
    }

    let mut end = text.len();
    if let Some(next) = later.iter().copied().find(|s| *s > object_start) {
        end = end.min(next);
    }
    if let Some(i) = rest.to_ascii_lowercase().find(CLOSE_TAG) {
        end = end.min(object_start + i);
    }
    for (i, _) in rest.match_indices('\n') {
        let line = rest[i + 1..].trim_start_matches([' ', '\t', '\r']);
        let continues = line
            .chars()
            .next()
            .is_some_and(|c| matches!(c, '{' | '}' | '[' | ']' | '"' | '\'' | ',' | ':' | '-') || c.is_ascii_digit());
        if !continues {
            end = end.min(object_start + i);
            break;
        }
    }
    end
}

/// Skip whitespace and an opening markdown fence after a marker.
fn skip_fence(text: &str, from: usize, limit: usize) -> usize {
    let region = &text[from..limit];
    let trimmed = region.trim_start();
    let Some(after_ticks) = trimmed.strip_prefix("```") else {
        return from;
    };
    // Fence language tag up to end of line.
    let lang_len = after_ticks.find('\n').unwrap_or(after_ticks.len());
    limit - (after_ticks.len() - lang_len)
}

fn strip_closing_fence(s: &str) -> &str {
    s.strip_suffix("```").map(str::trim_end).unwrap_or(s)
}

fn line_end(text: &str, from: usize) -> usize {
    text[from..].find('\n').map_or(text.len(), |i| from + i)
}
