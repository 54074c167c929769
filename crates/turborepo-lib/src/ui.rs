//! Terminal presentation: stable per-task prefix colors, prefixed writers
//! for interleaved output, and log replay.

use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    sync::{Arc, Mutex},
};

use console::{Style, StyledObject};
use turbopath::AbsoluteSystemPath;

/// Hands out ANSI styles for task prefixes, returning the same style for
/// the same key every time so a task keeps its color across the run.
#[derive(Clone, Default)]
pub struct ColorSelector {
    inner: Arc<Mutex<ColorSelectorState>>,
}

#[derive(Default)]
struct ColorSelectorState {
    idx: usize,
    cache: HashMap<String, Style>,
}

const COLORS: [fn() -> Style; 5] = [
    || Style::new().cyan(),
    || Style::new().magenta(),
    || Style::new().green(),
    || Style::new().yellow(),
    || Style::new().blue(),
];

impl ColorSelector {
    pub fn color_for_key(&self, key: &str) -> Style {
        let mut state = self.inner.lock().expect("color selector mutex poisoned");
        if let Some(style) = state.cache.get(key) {
            return style.clone();
        }
        let style = COLORS[state.idx % COLORS.len()]();
        state.idx += 1;
        state.cache.insert(key.to_string(), style.clone());
        style
    }

    pub fn prefix_with_color(&self, key: &str, prefix: &str) -> StyledObject<String> {
        self.color_for_key(key).apply_to(format!("{prefix}: "))
    }
}

/// Writer that stamps a prefix onto every line it forwards.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(prefix: StyledObject<String>, writer: W) -> Self {
        Self {
            prefix: prefix.to_string(),
            writer,
            buffer: Vec::new(),
        }
    }

    /// Writes one already-complete line.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{}{line}", self.prefix)
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            self.buffer.push(*byte);
            if *byte == b'\n' {
                self.writer.write_all(self.prefix.as_bytes())?;
                self.writer.write_all(&self.buffer)?;
                self.buffer.clear();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(self.prefix.as_bytes())?;
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        self.writer.flush()
    }
}

/// Replays a captured log file line by line into the given writer.
pub fn replay_logs<W: Write>(
    output: &mut PrefixedWriter<W>,
    log_file: &AbsoluteSystemPath,
) -> io::Result<()> {
    let file = log_file.open()?;
    let reader = io::BufReader::new(file);
    for line in reader.lines() {
        output.write_line(&line?)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_color_is_stable_per_key() {
        let selector = ColorSelector::default();
        let first = selector.color_for_key("app#build");
        let again = selector.color_for_key("app#build");
        assert_eq!(format!("{:?}", first), format!("{:?}", again));
    }

    #[test]
    fn test_prefixed_writer_stamps_lines() {
        let mut out = Vec::new();
        {
            let mut writer = PrefixedWriter::new(
                Style::new().apply_to("app:build: ".to_string()),
                &mut out,
            );
            writer.write_all(b"one\ntwo\n").unwrap();
            writer.flush().unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "app:build: one\napp:build: two\n");
    }

    #[test]
    fn test_prefixed_writer_flushes_partial_line() {
        let mut out = Vec::new();
        {
            let mut writer =
                PrefixedWriter::new(Style::new().apply_to("p: ".to_string()), &mut out);
            writer.write_all(b"no newline").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(String::from_utf8(out).unwrap(), "p: no newline");
    }
}
