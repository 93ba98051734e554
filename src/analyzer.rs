//! Locates `#Preview` blocks in Swift source and extracts the body of a
//! selected one.
//!
//! The scanner is textual: it finds `#Preview` markers, reads an optional
//! string-literal title from the argument list, and captures the
//! balanced-brace body while staying out of string literals and comments.
//! Previews declared with `traits:` arguments are skipped by the matcher;
//! that is a documented limitation, not an error.

use crate::{
    error::{BackendError, Result},
    protocol::Selector,
};

const MARKER: &str = "#Preview";

/// One preview declaration in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewBlock {
    /// Title argument, when present.
    pub title: Option<String>,
    /// The view expression between the braces, trimmed.
    pub body: String,
}

/// The preview a stream renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPreview {
    pub resolved_title: String,
    pub body_text: String,
    pub index: usize,
    pub count: usize,
}

/// Collect every matchable preview block, in source order.
#[must_use]
pub fn find_previews(source: &str) -> Vec<PreviewBlock> {
    let bytes = source.as_bytes();
    let mut previews = Vec::new();
    let mut offset = 0;

    while let Some(found) = source[offset..].find(MARKER) {
        let start = offset + found;
        offset = start + MARKER.len();

        // Reject identifiers that merely contain the marker text.
        if start > 0 && is_ident_byte(bytes[start - 1]) {
            continue;
        }
        if bytes.get(offset).copied().is_some_and(is_ident_byte) {
            continue;
        }

        let mut cursor = skip_whitespace(source, offset);
        let mut title = None;
        let mut has_traits = false;
        if bytes.get(cursor) == Some(&b'(') {
            let Some(close) = matching_paren(source, cursor) else {
                continue;
            };
            let args = &source[cursor + 1..close];
            title = first_string_literal(args);
            has_traits = args.contains("traits:");
            cursor = skip_whitespace(source, close + 1);
        }

        let Some(body_end) = (bytes.get(cursor) == Some(&b'{'))
            .then(|| matching_brace(source, cursor))
            .flatten()
        else {
            continue;
        };

        offset = body_end + 1;
        if has_traits {
            continue;
        }
        previews.push(PreviewBlock {
            title,
            body: source[cursor + 1..body_end].trim().to_string(),
        });
    }

    previews
}

/// Resolve `selector` against the previews found in `source`.
///
/// # Errors
///
/// `NoPreviewFound` when the file has no previews, `SelectorOutOfRange`
/// for a bad index, `SelectorNotFound` for an unmatched title
/// (case-sensitive).
pub fn select_preview(source: &str, selector: Option<&Selector>) -> Result<SelectedPreview> {
    let previews = find_previews(source);
    if previews.is_empty() {
        return Err(BackendError::NoPreviewFound);
    }

    let index = match selector {
        None => 0,
        Some(Selector::Index(index)) => {
            if *index >= previews.len() {
                return Err(BackendError::SelectorOutOfRange {
                    index: *index,
                    count: previews.len(),
                });
            }
            *index
        }
        Some(Selector::Title(title)) => previews
            .iter()
            .position(|p| p.title.as_deref() == Some(title))
            .ok_or_else(|| BackendError::SelectorNotFound(title.clone()))?,
    };

    let count = previews.len();
    let block = &previews[index];
    Ok(SelectedPreview {
        resolved_title: block
            .title
            .clone()
            .unwrap_or_else(|| format!("Preview {}", index + 1)),
        body_text: block.body.clone(),
        index,
        count,
    })
}

/// Index of the preview after `current`, wrapping past the last one.
#[must_use]
pub const fn next_preview(current: usize, count: usize) -> usize {
    (current + 1) % count
}

const fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn skip_whitespace(source: &str, mut cursor: usize) -> usize {
    let bytes = source.as_bytes();
    while bytes.get(cursor).is_some_and(u8::is_ascii_whitespace) {
        cursor += 1;
    }
    cursor
}

fn matching_paren(source: &str, open: usize) -> Option<usize> {
    matching_delimiter(source, open, b'(', b')')
}

fn matching_brace(source: &str, open: usize) -> Option<usize> {
    matching_delimiter(source, open, b'{', b'}')
}

/// Balanced-delimiter scan that skips string literals (including Swift
/// triple-quoted strings) and comments.
fn matching_delimiter(source: &str, open: usize, opener: u8, closer: u8) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut cursor = open;

    while cursor < bytes.len() {
        match bytes[cursor] {
            b'"' => {
                cursor = skip_string(bytes, cursor)?;
                continue;
            }
            b'/' if bytes.get(cursor + 1) == Some(&b'/') => {
                while cursor < bytes.len() && bytes[cursor] != b'\n' {
                    cursor += 1;
                }
                continue;
            }
            b'/' if bytes.get(cursor + 1) == Some(&b'*') => {
                cursor += 2;
                while cursor + 1 < bytes.len()
                    && !(bytes[cursor] == b'*' && bytes[cursor + 1] == b'/')
                {
                    cursor += 1;
                }
                cursor += 2;
                continue;
            }
            byte if byte == opener => depth += 1,
            byte if byte == closer => {
                depth -= 1;
                if depth == 0 {
                    return Some(cursor);
                }
            }
            _ => {}
        }
        cursor += 1;
    }
    None
}

/// Advance past a string literal starting at `open` (a `"`), returning the
/// index just after its closing quote.
fn skip_string(bytes: &[u8], open: usize) -> Option<usize> {
    let triple = bytes[open..].starts_with(b"\"\"\"");
    let mut cursor = open + if triple { 3 } else { 1 };

    while cursor < bytes.len() {
        match bytes[cursor] {
            b'\\' => cursor += 2,
            b'"' if triple => {
                if bytes[cursor..].starts_with(b"\"\"\"") {
                    return Some(cursor + 3);
                }
                cursor += 1;
            }
            b'"' => return Some(cursor + 1),
            _ => cursor += 1,
        }
    }
    None
}

fn first_string_literal(args: &str) -> Option<String> {
    let bytes = args.as_bytes();
    let open = args.find('"')?;
    let close = skip_string(bytes, open)?;
    Some(args[open + 1..close - 1].to_string())
}

#[cfg(test)]
mod tests {
    use super::{find_previews, next_preview, select_preview};
    use crate::{error::BackendError, protocol::Selector};

    const TWO_PREVIEWS: &str = r#"
import SwiftUI

struct ContentView: View {
    var body: some View {
        Text("Hello")
    }
}

#Preview("Light") {
    ContentView()
}

#Preview("Dark") {
    ContentView()
        .preferredColorScheme(.dark)
}
"#;

    #[test]
    fn finds_titled_previews_in_order() {
        let previews = find_previews(TWO_PREVIEWS);
        assert_eq!(previews.len(), 2);
        assert_eq!(previews[0].title.as_deref(), Some("Light"));
        assert_eq!(previews[1].title.as_deref(), Some("Dark"));
        assert_eq!(previews[0].body, "ContentView()");
        assert!(previews[1].body.contains(".preferredColorScheme(.dark)"));
    }

    #[test]
    fn untitled_preview_gets_a_positional_title() {
        let selected = select_preview("#Preview {\n  Text(\"hi\")\n}", None).unwrap();
        assert_eq!(selected.resolved_title, "Preview 1");
        assert_eq!(selected.body_text, "Text(\"hi\")");
        assert_eq!(selected.count, 1);
    }

    #[test]
    fn default_selector_is_the_first_preview() {
        let selected = select_preview(TWO_PREVIEWS, None).unwrap();
        assert_eq!(selected.index, 0);
        assert_eq!(selected.resolved_title, "Light");
    }

    #[test]
    fn title_selector_is_case_sensitive() {
        let hit = select_preview(TWO_PREVIEWS, Some(&Selector::Title("Dark".into())));
        assert_eq!(hit.unwrap().index, 1);

        let miss = select_preview(TWO_PREVIEWS, Some(&Selector::Title("dark".into())));
        assert!(matches!(miss, Err(BackendError::SelectorNotFound(_))));
    }

    #[test]
    fn index_selector_bounds_are_checked() {
        let err = select_preview(TWO_PREVIEWS, Some(&Selector::Index(99))).unwrap_err();
        assert!(matches!(
            err,
            BackendError::SelectorOutOfRange { index: 99, count: 2 }
        ));
    }

    #[test]
    fn empty_file_has_no_previews() {
        assert!(matches!(
            select_preview("struct V {}", None),
            Err(BackendError::NoPreviewFound)
        ));
    }

    #[test]
    fn traits_previews_are_skipped() {
        let source = r#"
#Preview("Landscape", traits: .landscapeLeft) {
    ContentView()
}
#Preview("Plain") {
    ContentView()
}
"#;
        let previews = find_previews(source);
        assert_eq!(previews.len(), 1);
        assert_eq!(previews[0].title.as_deref(), Some("Plain"));
    }

    #[test]
    fn braces_in_strings_and_comments_do_not_confuse_the_scanner() {
        let source = r#"
#Preview {
    // a comment with a stray }
    Text("brace } inside")
        .padding()
}
"#;
        let previews = find_previews(source);
        assert_eq!(previews.len(), 1);
        assert!(previews[0].body.contains("brace } inside"));
    }

    #[test]
    fn marker_inside_identifier_is_ignored() {
        assert!(find_previews("let my#Previewish = 1").is_empty());
        assert!(find_previews("#PreviewRegistry { }").is_empty());
    }

    #[test]
    fn next_preview_wraps_and_round_trips() {
        assert_eq!(next_preview(0, 3), 1);
        assert_eq!(next_preview(2, 3), 0);

        let mut index = 1;
        for _ in 0..4 {
            index = next_preview(index, 4);
        }
        assert_eq!(index, 1);
    }
}
