//! Streaming-safe markdown → HTML-subset conversion.
//!
//! Already-final markup regions (code blocks, inline code, blockquotes, tags
//! we generated ourselves) are swapped for single-codepoint sentinels before
//! escaping and conversion, then substituted back, so repeated passes over a
//! growing buffer never re-escape or re-convert finished output. That is
//! what keeps the rendered message stable between streaming updates.

use tracing::warn;

use super::balance::close_tags;

/// Sentinels live in the Unicode Private Use Area; one codepoint per
/// protected region.
const SENTINEL_BASE: u32 = 0xE000;
/// Stay well inside the BMP private use area (U+E000..U+F8FF).
const SENTINEL_CAPACITY: usize = 0x1800;

const FENCE: &str = "```";

/// Tags this crate emits itself; protected from re-escaping when they appear
/// in the raw buffer (continuation headers, status lines).
const OWN_TAGS: [&str; 6] = ["b", "i", "code", "pre", "s", "u"];

/// Convert markdown to transport HTML and balance-close the result.
///
/// Never fails: any internal limit degrades to the fully-escaped raw text.
/// Safe to call repeatedly on a growing prefix of the same text.
pub fn format(text: &str, streaming: bool) -> String {
    close_tags(&convert_markdown(text, streaming))
}

/// The conversion pass without the tag-balance closer.
pub fn convert_markdown(text: &str, streaming: bool) -> String {
    if text.is_empty() {
        return String::new();
    }
    match convert_impl(text, streaming) {
        Some(html) => html,
        None => {
            warn!(len = text.len(), "markdown conversion degraded to escaped text");
            escape_text(text)
        }
    }
}

/// Escape for HTML body text.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape inside `<code>`/`<pre>` regions; quotes render fine there.
pub fn escape_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn sentinel(index: usize) -> char {
    // Index is bounded by SENTINEL_CAPACITY, so this stays a valid scalar.
    char::from_u32(SENTINEL_BASE + index as u32).unwrap_or('\u{FFFD}')
}

fn in_sentinel_range(ch: char) -> bool {
    (ch as u32) >= SENTINEL_BASE && (ch as u32) < SENTINEL_BASE + SENTINEL_CAPACITY as u32
}

fn new_sentinel(placeholders: &mut Vec<String>, value: String) -> Option<char> {
    if placeholders.len() >= SENTINEL_CAPACITY {
        return None;
    }
    let ch = sentinel(placeholders.len());
    placeholders.push(value);
    Some(ch)
}

fn convert_impl(text: &str, streaming: bool) -> Option<String> {
    // Raw input already using our private range would corrupt substitution.
    if text.chars().any(in_sentinel_range) {
        return None;
    }

    let mut placeholders: Vec<String> = Vec::new();

    // 1. Unterminated fenced block at the tail: provisionally open it and
    //    re-attach after conversion; the balance closer supplies the closing
    //    tags.
    let mut deferred_open_code: Option<char> = None;
    let mut work: String;
    if streaming && count_occurrences(text, FENCE) % 2 == 1 {
        let last = text.rfind(FENCE).unwrap_or(0);
        let tail = &text[last + FENCE.len()..];
        let (lang, code) = split_fence_lang(tail);
        let value = format!("{}{}", pre_open(lang), escape_code(code));
        deferred_open_code = Some(new_sentinel(&mut placeholders, value)?);
        work = text[..last].to_string();
    } else {
        work = text.to_string();
    }

    // 2. Fully closed fenced blocks.
    work = protect_fenced_blocks(&work, &mut placeholders)?;

    // 3. Inline code spans.
    work = protect_inline_code(&work, &mut placeholders)?;

    // 3.5. Blockquotes we generated (thinking previews), closed first, then
    //      an unclosed one at the tail while streaming.
    work = protect_closed_blockquotes(&work, &mut placeholders)?;
    if streaming {
        work = protect_unclosed_blockquote(&work, &mut placeholders)?;
    }

    // 3.6. Our own paired inline tags pass through untouched.
    work = protect_own_tags(&work, &mut placeholders)?;

    // 4. Everything still visible is raw text.
    work = escape_text(&work);

    // 5. Markdown conversions, each skipped when the tail is an unpaired
    //    opening delimiter split across stream chunks. A trailing marker
    //    with an even count closes a pair and converts normally.
    let trimmed = work.trim_end();
    if !(streaming && tail_is_open_marker(trimmed, "**")) {
        work = convert_paired(&work, "**", "b");
    }
    let trimmed = work.trim_end();
    if !(streaming && tail_is_open_marker(trimmed, "__")) {
        work = convert_paired(&work, "__", "u");
    }
    let trimmed = work.trim_end();
    if !(streaming && tail_is_open_marker(trimmed, "~~")) {
        work = convert_paired(&work, "~~", "s");
    }
    let trimmed = work.trim_end();
    if !(streaming
        && trimmed.ends_with('*')
        && !trimmed.ends_with("**")
        && lone_star_runs(trimmed) % 2 == 1)
    {
        work = convert_italic(&work);
    }

    // 6. The provisional code block reopens at the very end.
    if let Some(ch) = deferred_open_code {
        work.push(ch);
    }

    // 7. Substitute sentinels back, newest first so regions nested inside a
    //    later-protected region (code inside a blockquote) expand too.
    for index in (0..placeholders.len()).rev() {
        let ch = sentinel(index);
        if let Some(pos) = work.find(ch) {
            work.replace_range(pos..pos + ch.len_utf8(), &placeholders[index]);
        }
    }

    Some(work)
}

fn count_occurrences(text: &str, needle: &str) -> usize {
    let mut count = 0;
    let mut rest = text;
    while let Some(pos) = rest.find(needle) {
        count += 1;
        rest = &rest[pos + needle.len()..];
    }
    count
}

/// A trailing delimiter is an opener (not a close) when the marker count so
/// far is odd.
fn tail_is_open_marker(text: &str, marker: &str) -> bool {
    text.ends_with(marker) && count_occurrences(text, marker) % 2 == 1
}

/// Runs of exactly one `*`; the delimiters convert_italic pairs up.
fn lone_star_runs(text: &str) -> usize {
    let mut runs = 0;
    let mut current = 0usize;
    for ch in text.chars() {
        if ch == '*' {
            current += 1;
        } else {
            if current == 1 {
                runs += 1;
            }
            current = 0;
        }
    }
    if current == 1 {
        runs += 1;
    }
    runs
}

/// Split an optional ASCII language hint (and one following newline) off the
/// front of fenced-block content.
fn split_fence_lang(content: &str) -> (&str, &str) {
    let mut lang_len = 0;
    let bytes = content.as_bytes();
    if bytes.first().is_some_and(|b| b.is_ascii_alphabetic()) {
        lang_len = 1;
        while bytes.get(lang_len).is_some_and(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'-')
        }) {
            lang_len += 1;
        }
    }
    let lang = &content[..lang_len];
    let rest = content[lang_len..].strip_prefix('\n').unwrap_or(&content[lang_len..]);
    (lang, rest)
}

fn pre_open(lang: &str) -> String {
    if lang.is_empty() {
        "<pre><code>".to_string()
    } else {
        format!("<pre><code class=\"language-{lang}\">")
    }
}

fn protect_fenced_blocks(text: &str, placeholders: &mut Vec<String>) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(FENCE) {
        let after = &rest[start + FENCE.len()..];
        let Some(end) = after.find(FENCE) else {
            break;
        };
        out.push_str(&rest[..start]);
        let (lang, code) = split_fence_lang(&after[..end]);
        let value = format!("{}{}</code></pre>", pre_open(lang), escape_code(code));
        out.push(new_sentinel(placeholders, value)?);
        rest = &after[end + FENCE.len()..];
    }
    out.push_str(rest);
    Some(out)
}

fn protect_inline_code(text: &str, placeholders: &mut Vec<String>) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('`') {
        let after = &rest[start + 1..];
        match after.find('`') {
            Some(end) if end > 0 && !after[..end].contains('\n') => {
                out.push_str(&rest[..start]);
                let value = format!("<code>{}</code>", escape_code(&after[..end]));
                out.push(new_sentinel(placeholders, value)?);
                rest = &after[end + 1..];
            }
            _ => {
                // Unpaired backtick stays literal; the next one may open a
                // span of its own.
                out.push_str(&rest[..start + 1]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Some(out)
}

const BLOCKQUOTE_OPEN: &str = "<blockquote";
const BLOCKQUOTE_CLOSE: &str = "</blockquote>";

fn protect_closed_blockquotes(text: &str, placeholders: &mut Vec<String>) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(BLOCKQUOTE_OPEN) {
        let tag_rest = &rest[start + BLOCKQUOTE_OPEN.len()..];
        let attrs_end = match tag_rest.find('>') {
            Some(pos) if !tag_rest[..pos].contains('<') => pos,
            _ => {
                out.push_str(&rest[..start + BLOCKQUOTE_OPEN.len()]);
                rest = tag_rest;
                continue;
            }
        };
        let content_rest = &tag_rest[attrs_end + 1..];
        let Some(close) = content_rest.find(BLOCKQUOTE_CLOSE) else {
            out.push_str(&rest[..start + BLOCKQUOTE_OPEN.len()]);
            rest = tag_rest;
            continue;
        };
        out.push_str(&rest[..start]);
        // Content is kept verbatim: it already holds escaped text and
        // sentinels from earlier passes.
        let value = format!(
            "<blockquote{}>{}</blockquote>",
            &tag_rest[..attrs_end],
            &content_rest[..close]
        );
        out.push(new_sentinel(placeholders, value)?);
        rest = &content_rest[close + BLOCKQUOTE_CLOSE.len()..];
    }
    out.push_str(rest);
    Some(out)
}

/// An opening blockquote with no close yet (still streaming) is shown
/// provisionally closed; the next update re-renders it properly.
fn protect_unclosed_blockquote(text: &str, placeholders: &mut Vec<String>) -> Option<String> {
    let Some(start) = text.find(BLOCKQUOTE_OPEN) else {
        return Some(text.to_string());
    };
    if text[start..].contains(BLOCKQUOTE_CLOSE) {
        // A stray close without a matching open; leave as-is.
        return Some(text.to_string());
    }
    let tag_rest = &text[start + BLOCKQUOTE_OPEN.len()..];
    let Some(attrs_end) = tag_rest.find('>') else {
        return Some(text.to_string());
    };
    if tag_rest[..attrs_end].contains('<') {
        return Some(text.to_string());
    }
    let value = format!(
        "<blockquote{}>{}</blockquote>",
        &tag_rest[..attrs_end],
        &tag_rest[attrs_end + 1..]
    );
    let mut out = text[..start].to_string();
    out.push(new_sentinel(placeholders, value)?);
    Some(out)
}

fn protect_own_tags(text: &str, placeholders: &mut Vec<String>) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'outer: while let Some(start) = rest.find('<') {
        let at_tag = &rest[start..];
        for tag in OWN_TAGS {
            let open_len = tag.len() + 2;
            if !(at_tag.starts_with('<')
                && at_tag.len() > open_len
                && at_tag[1..].starts_with(tag)
                && at_tag[1 + tag.len()..].starts_with('>'))
            {
                continue;
            }
            let content_rest = &at_tag[open_len..];
            let Some(lt) = content_rest.find('<') else {
                continue;
            };
            let close = format!("</{tag}>");
            if !content_rest[lt..].starts_with(&close) {
                continue;
            }
            out.push_str(&rest[..start]);
            let value = format!("<{tag}>{}{close}", &content_rest[..lt]);
            out.push(new_sentinel(placeholders, value)?);
            rest = &content_rest[lt + close.len()..];
            continue 'outer;
        }
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Convert `marker x marker` pairs into `<tag>x</tag>`, non-greedily; the
/// content may contain lone marker characters.
fn convert_paired(text: &str, marker: &str, tag: &str) -> String {
    let marker_char = marker.chars().next().unwrap_or('*');
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(marker) {
        let after = &rest[start + marker.len()..];
        // A longer run at the opener reads as literal leading marker
        // characters; step one char and retry, like a backtracking regex.
        let paired = match after.chars().next() {
            Some(first) if first != marker_char => {
                let skip = first.len_utf8();
                after[skip..].find(marker).map(|pos| pos + skip)
            }
            _ => None,
        };
        match paired {
            Some(end) => {
                out.push_str(&rest[..start]);
                out.push('<');
                out.push_str(tag);
                out.push('>');
                out.push_str(&after[..end]);
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
                rest = &after[end + marker.len()..];
            }
            None => {
                // No pair completes here; step past one character like a
                // regex engine would.
                let step = rest[start..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&rest[..start + step]);
                rest = &rest[start + step..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Italic needs lone-asterisk delimiters: runs of exactly one `*`, paired
/// with the next lone run, no other `*` in between.
fn convert_italic(text: &str) -> String {
    // Collect maximal '*' runs as (byte_start, byte_len).
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut iter = text.char_indices().peekable();
    while let Some((pos, ch)) = iter.next() {
        if ch != '*' {
            continue;
        }
        let mut len = 1;
        while iter.peek().is_some_and(|&(_, c)| c == '*') {
            iter.next();
            len += 1;
        }
        runs.push((pos, len));
    }

    let mut out = String::with_capacity(text.len());
    let mut consumed = 0;
    let mut open: Option<usize> = None; // byte index just past an opening '*'
    for (pos, len) in runs {
        if len != 1 {
            // A multi-star run invalidates any pending opening delimiter.
            open = None;
            continue;
        }
        match open {
            None => open = Some(pos),
            Some(open_pos) => {
                out.push_str(&text[consumed..open_pos]);
                out.push_str("<i>");
                out.push_str(&text[open_pos + 1..pos]);
                out.push_str("</i>");
                consumed = pos + 1;
                open = None;
            }
        }
    }
    out.push_str(&text[consumed..]);
    out
}

/// Stateful wrapper used per message segment: tracks the last rendered
/// output so callers can skip no-op updates, and resets across segments.
#[derive(Default)]
pub struct MarkdownStreamFormatter {
    last_rendered: String,
}

impl MarkdownStreamFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rendered markup and whether it differs from the previous
    /// call.
    pub fn format(&mut self, raw_text: &str, is_final: bool) -> (String, bool) {
        if raw_text.is_empty() {
            return (String::new(), false);
        }
        let html = format(raw_text, !is_final);
        let changed = html != self.last_rendered;
        self.last_rendered = html.clone();
        (html, changed)
    }

    pub fn reset(&mut self) {
        self.last_rendered.clear();
    }
}
