//! Label injection for exposition-format text.
//!
//! This is a textual rewrite, not a parser: each line is classified by
//! a couple of cheap checks and either gets the label text spliced in or
//! is passed through untouched. Malformed lines survive as-is.

use std::borrow::Cow;

use fanin_core::LabelSet;

/// Rewrite one line so it carries `labels`.
///
/// - A comment line (leading `#`) is returned unchanged, braces or not.
/// - A line with a `{` gets `labels,` inserted right after the first `{`.
/// - A line of exactly two whitespace-separated tokens (`name value`)
///   becomes `name{labels} value`.
/// - Anything else is returned unchanged.
pub fn annotate_line<'a>(line: &'a str, labels: &str) -> Cow<'a, str> {
    if line.starts_with('#') {
        return Cow::Borrowed(line);
    }

    if let Some(pos) = line.find('{') {
        let (head, tail) = line.split_at(pos + 1);
        let mut out = String::with_capacity(line.len() + labels.len() + 1);
        out.push_str(head);
        out.push_str(labels);
        out.push(',');
        out.push_str(tail);
        return Cow::Owned(out);
    }

    let mut tokens = line.split_whitespace();
    if let (Some(name), Some(value), None) = (tokens.next(), tokens.next(), tokens.next()) {
        return Cow::Owned(format!("{name}{{{labels}}} {value}"));
    }

    Cow::Borrowed(line)
}

/// Lazily annotate a sequence of lines. Each yielded line ends in `\n`.
pub fn annotate<'a, I>(lines: I, labels: &'a str) -> Annotate<'a, I::IntoIter>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    Annotate {
        lines: lines.into_iter(),
        labels,
    }
}

/// Iterator returned by [`annotate`].
pub struct Annotate<'a, I> {
    lines: I,
    labels: &'a str,
}

impl<I> Iterator for Annotate<'_, I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let line = self.lines.next()?;
        let mut out = annotate_line(line.as_ref(), self.labels).into_owned();
        out.push('\n');
        Some(out)
    }
}

/// Incremental annotator fed with raw body chunks.
///
/// Chunks may split lines anywhere; complete lines are annotated as soon
/// as their newline arrives, so only the annotated output and at most one
/// partial line are held in memory.
#[derive(Debug)]
pub struct StreamAnnotator {
    labels: String,
    pending: Vec<u8>,
    out: String,
    lines: usize,
}

impl StreamAnnotator {
    pub fn new(labels: &LabelSet) -> Self {
        Self {
            labels: labels.render(),
            pending: Vec::new(),
            out: String::new(),
            lines: 0,
        }
    }

    /// Consume the next chunk of the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            if self.pending.is_empty() {
                self.push_line(line);
            } else {
                let mut joined = std::mem::take(&mut self.pending);
                joined.extend_from_slice(line);
                self.push_line(&joined);
            }
            rest = &tail[1..];
        }
        self.pending.extend_from_slice(rest);
    }

    /// Number of lines emitted so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Flush a trailing unterminated line and return the annotated text.
    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            let last = std::mem::take(&mut self.pending);
            self.push_line(&last);
        }
        self.out
    }

    fn push_line(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        self.out.push_str(&annotate_line(&line, &self.labels));
        self.out.push('\n');
        self.lines += 1;
    }
}
