//! Reading the seed artifact.
//!
//! The seed is a user story typed on a terminal (ended by an `END` line or end of input) or
//! read from a file, optionally followed by an MVP description.

use std::io::{self, BufRead};
use std::path::Path;

/// Line that ends interactive story input.
pub const END_SENTINEL: &str = "END";

/// Separator placed between the user story and the MVP description.
pub const MVP_LABEL: &str = "\n\nMVP:\n";

/// Read lines until one equals [`END_SENTINEL`] or the input ends.
///
/// Every kept line is terminated by `\n`, whatever line ending the input used.
pub fn read_story_lines<R: BufRead>(reader: R) -> io::Result<String> {
    let mut story = String::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if line == END_SENTINEL {
            break;
        }
        story.push_str(line);
        story.push('\n');
    }
    Ok(story)
}

/// Read a text file and normalize its punctuation.
pub fn read_text_file(path: impl AsRef<Path>) -> io::Result<String> {
    let path = path.as_ref();
    log::debug!("Reading {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Ok(normalize_text(&text))
}

/// Append the MVP description to the story, when there is one.
pub fn compose_seed(story: &str, mvp: Option<&str>) -> String {
    match mvp {
        Some(mvp) => format!("{}{}{}", story, MVP_LABEL, mvp),
        None => story.to_string(),
    }
}

/// Replace typographic punctuation with plain ASCII.
///
/// ```
/// use storychain::input::normalize_text;
///
/// assert_eq!(normalize_text("\u{201c}Done\u{201d} \u{2013} almost\u{2026}"), "\"Done\" - almost...");
/// ```
pub fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{2013}' | '\u{2014}' => normalized.push('-'),
            '\u{2018}' | '\u{2019}' => normalized.push('\''),
            '\u{201c}' | '\u{201d}' => normalized.push('"'),
            '\u{2026}' => normalized.push_str("..."),
            '\u{00a0}' => normalized.push(' '),
            other => normalized.push(other),
        }
    }
    normalized
}
