//! Tag-balance closer: a small scanner + stack instead of regex chains.
//!
//! Scans rendered markup left to right, tokenizing into text runs, opening
//! tags, and closing tags, and appends whatever closing tags are needed so
//! the output is always well-formed. A truncated trailing opening tag
//! (`<b` with no `>`) is dropped entirely.

/// Tags that never take a closing counterpart.
const VOID_TAGS: [&str; 3] = ["br", "hr", "img"];

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Open(&'a str),
    Close(&'a str),
}

/// Yields tag tokens; plain text runs are skipped since only tags affect
/// balance.
fn scan_tags(text: &str) -> impl Iterator<Item = Token<'_>> {
    let mut rest = text;
    std::iter::from_fn(move || {
        loop {
            let start = rest.find('<')?;
            let tag = &rest[start + 1..];
            let (closing, name_start) = match tag.strip_prefix('/') {
                Some(after_slash) => (true, after_slash),
                None => (false, tag),
            };
            let name_len = name_start
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(name_start.len());
            let name = &name_start[..name_len];
            let Some(end) = tag.find('>') else {
                // Truncated tag at the tail; nothing more to scan.
                rest = "";
                return None;
            };
            rest = &tag[end + 1..];
            if name.is_empty() {
                continue;
            }
            return Some(if closing {
                Token::Close(name)
            } else {
                Token::Open(name)
            });
        }
    })
}

/// Returns the stack of tag names opened but not yet closed, outermost first.
pub fn open_tags(text: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    for token in scan_tags(text) {
        match token {
            Token::Open(name) => {
                let lower = name.to_ascii_lowercase();
                if !VOID_TAGS.contains(&lower.as_str()) {
                    stack.push(lower);
                }
            }
            Token::Close(name) => {
                let lower = name.to_ascii_lowercase();
                if stack.last().map(String::as_str) == Some(lower.as_str()) {
                    stack.pop();
                }
            }
        }
    }
    stack
}

/// Closes every open tag so the transport never sees unbalanced markup.
pub fn close_tags(text: &str) -> String {
    // Drop an incomplete opening tag at the very end ("<b" without ">").
    let mut text = text;
    let last_open = text.rfind('<');
    let last_close = text.rfind('>');
    if let Some(open) = last_open {
        if last_close.map_or(true, |close| open > close) {
            text = &text[..open];
        }
    }

    let stack = open_tags(text);
    if stack.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + stack.len() * 8);
    out.push_str(text);
    for name in stack.iter().rev() {
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_tags_tracks_nesting() {
        assert_eq!(open_tags("<b><i>x</i>"), vec!["b".to_string()]);
        assert!(open_tags("<b>x</b>").is_empty());
        assert_eq!(
            open_tags("<pre><code class=\"language-rs\">x"),
            vec!["pre".to_string(), "code".to_string()]
        );
    }

    #[test]
    fn test_open_tags_ignores_void_tags() {
        assert!(open_tags("line<br>next").is_empty());
    }

    #[test]
    fn test_open_tags_ignores_mismatched_close() {
        // Stray close never pops a non-matching top.
        assert_eq!(open_tags("<b>x</i>"), vec!["b".to_string()]);
    }

    #[test]
    fn test_close_tags_appends_in_reverse_order() {
        assert_eq!(close_tags("<b><i>x"), "<b><i>x</i></b>");
    }

    #[test]
    fn test_close_tags_drops_truncated_opening_tag() {
        assert_eq!(close_tags("text <b"), "text ");
        assert_eq!(close_tags("<b>bold</b> <co"), "<b>bold</b> ");
    }

    #[test]
    fn test_close_tags_noop_on_balanced_input() {
        let html = "<b>x</b> plain <code>y</code>";
        assert_eq!(close_tags(html), html);
    }

    #[test]
    fn test_escaped_entities_do_not_look_like_tags() {
        assert_eq!(close_tags("a &lt;b&gt; c"), "a &lt;b&gt; c");
    }
}
