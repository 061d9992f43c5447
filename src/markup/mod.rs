//! Streaming-safe markdown → transport-markup conversion.

mod balance;
mod formatter;

pub use balance::{close_tags, open_tags};
pub use formatter::{
    convert_markdown, escape_code, escape_text, format, MarkdownStreamFormatter,
};
