// ABOUTME: VT100-emulated terminal buffer capturing PTY output with colors
//
// Wraps a vt100 parser so the preview pane can show what the agent's terminal
// currently displays, colors included, without a live multiplexer round trip.

use lazy_static::lazy_static;
use regex::bytes::Regex;
use std::sync::RwLock;

const DEFAULT_TERM_WIDTH: u16 = 80;
const DEFAULT_TERM_HEIGHT: u16 = 24;

lazy_static! {
    // OSC 8 hyperlink sequences: ESC ] 8 ; params ; URI terminated by ST
    // (ESC \) or BEL. The vt100 emulator does not understand them and would
    // render them as visible garbage, so they are stripped before feeding.
    static ref OSC8_RE: Regex =
        Regex::new(r"(?-u)\x1b\]8;[^;]*;[^\x1b\x07]*(?:\x1b\\|\x07)").unwrap();
}

struct Inner {
    parser: vt100::Parser,
    rows: u16,
    cols: u16,
    cached_render: Option<String>,
    dirty: bool,
}

/// A thread-safe terminal buffer with a cached ANSI render of its contents.
pub struct TerminalBuffer {
    inner: RwLock<Inner>,
}

impl Default for TerminalBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalBuffer {
    pub fn new() -> Self {
        Self::with_size(DEFAULT_TERM_HEIGHT, DEFAULT_TERM_WIDTH)
    }

    pub fn with_size(rows: u16, cols: u16) -> Self {
        Self {
            inner: RwLock::new(Inner {
                parser: vt100::Parser::new(rows, cols, 0),
                rows,
                cols,
                cached_render: None,
                dirty: true,
            }),
        }
    }

    /// Feeds raw PTY output to the emulator.
    ///
    /// Returns the length of the original input so writers never observe an
    /// adjusted count from the OSC 8 stripping.
    pub fn write(&self, data: &[u8]) -> usize {
        let cleaned = OSC8_RE.replace_all(data, &b""[..]);

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.parser.process(&cleaned);
        if !cleaned.is_empty() {
            inner.dirty = true;
        }
        data.len()
    }

    /// Changes the terminal dimensions. A no-op if they are unchanged.
    pub fn resize(&self, rows: u16, cols: u16) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if rows != inner.rows || cols != inner.cols {
            inner.parser.set_size(rows, cols);
            inner.rows = rows;
            inner.cols = cols;
            inner.dirty = true;
        }
    }

    /// Returns the current screen content as an ANSI-encoded string.
    ///
    /// Renders from the grid only when the buffer changed since the last
    /// call; an unchanged buffer returns the cached, bytewise-identical
    /// output.
    pub fn render(&self) -> String {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if !inner.dirty {
            if let Some(cached) = &inner.cached_render {
                return cached.clone();
            }
        }

        let rendered = render_to_ansi(&inner.parser, inner.rows, inner.cols);
        inner.cached_render = Some(rendered.clone());
        inner.dirty = false;
        rendered
    }

    /// Clears the buffer, allocating a fresh emulator at the current size.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.parser = vt100::Parser::new(inner.rows, inner.cols, 0);
        inner.cached_render = None;
        inner.dirty = true;
    }

    /// Current dimensions as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        (inner.rows, inner.cols)
    }
}

/// Per-cell display attributes relevant to rendering.
#[derive(Clone, Copy, PartialEq)]
struct CellFormat {
    fg: vt100::Color,
    bg: vt100::Color,
    bold: bool,
    italic: bool,
    underline: bool,
    inverse: bool,
}

impl Default for CellFormat {
    fn default() -> Self {
        Self {
            fg: vt100::Color::Default,
            bg: vt100::Color::Default,
            bold: false,
            italic: false,
            underline: false,
            inverse: false,
        }
    }
}

impl CellFormat {
    fn of(cell: &vt100::Cell) -> Self {
        Self {
            fg: cell.fgcolor(),
            bg: cell.bgcolor(),
            bold: cell.bold(),
            italic: cell.italic(),
            underline: cell.underline(),
            inverse: cell.inverse(),
        }
    }
}

fn render_to_ansi(parser: &vt100::Parser, rows: u16, cols: u16) -> String {
    let screen = parser.screen();
    let mut out = String::with_capacity(rows as usize * cols as usize * 2);

    // Starting from the default format means unstyled content renders as
    // plain text with no leading escape sequence.
    let mut prev_format = CellFormat::default();

    for row in 0..rows {
        if row > 0 {
            out.push('\n');
        }

        // Render up to the last non-blank cell to avoid trailing spaces.
        let mut last_non_blank: Option<u16> = None;
        for col in (0..cols).rev() {
            if let Some(cell) = screen.cell(row, col) {
                if !cell.contents().trim().is_empty() {
                    last_non_blank = Some(col);
                    break;
                }
            }
        }
        let Some(last) = last_non_blank else {
            continue;
        };

        for col in 0..=last {
            let Some(cell) = screen.cell(row, col) else {
                out.push(' ');
                continue;
            };

            let format = CellFormat::of(cell);
            if format != prev_format {
                out.push_str(&format_to_ansi(&format));
                prev_format = format;
            }

            let contents = cell.contents();
            if contents.is_empty() {
                out.push(' ');
            } else {
                out.push_str(&contents);
            }
        }
    }

    out.push_str("\x1b[0m");
    out
}

/// Converts a cell format to a minimal SGR sequence resetting prior state.
fn format_to_ansi(format: &CellFormat) -> String {
    let mut codes: Vec<String> = vec!["0".to_string()];

    if format.bold {
        codes.push("1".to_string());
    }
    if format.italic {
        codes.push("3".to_string());
    }
    if format.underline {
        codes.push("4".to_string());
    }
    if format.inverse {
        codes.push("7".to_string());
    }
    if let Some(fg) = color_to_sgr(format.fg, true) {
        codes.push(fg);
    }
    if let Some(bg) = color_to_sgr(format.bg, false) {
        codes.push(bg);
    }

    format!("\x1b[{}m", codes.join(";"))
}

/// Emits 24-bit truecolor codes for every color so the preview never loses
/// fidelity to a 256-color palette remapping.
fn color_to_sgr(color: vt100::Color, foreground: bool) -> Option<String> {
    let (r, g, b) = match color {
        vt100::Color::Default => return None,
        vt100::Color::Rgb(r, g, b) => (r, g, b),
        vt100::Color::Idx(idx) => idx_to_rgb(idx),
    };
    let base = if foreground { 38 } else { 48 };
    Some(format!("{base};2;{r};{g};{b}"))
}

/// Maps an xterm-256 palette index to its RGB value.
fn idx_to_rgb(idx: u8) -> (u8, u8, u8) {
    const BASIC: [(u8, u8, u8); 16] = [
        (0, 0, 0),
        (205, 0, 0),
        (0, 205, 0),
        (205, 205, 0),
        (0, 0, 238),
        (205, 0, 205),
        (0, 205, 205),
        (229, 229, 229),
        (127, 127, 127),
        (255, 0, 0),
        (0, 255, 0),
        (255, 255, 0),
        (92, 92, 255),
        (255, 0, 255),
        (0, 255, 255),
        (255, 255, 255),
    ];

    match idx {
        0..=15 => BASIC[idx as usize],
        16..=231 => {
            let idx = idx - 16;
            let levels = [0u8, 95, 135, 175, 215, 255];
            let r = levels[(idx / 36) as usize];
            let g = levels[((idx % 36) / 6) as usize];
            let b = levels[(idx % 6) as usize];
            (r, g, b)
        }
        232..=255 => {
            let gray = 8 + 10 * (idx - 232);
            (gray, gray, gray)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii_renders_as_raw_text_plus_reset() {
        let buffer = TerminalBuffer::with_size(3, 20);
        buffer.write(b"hello world");

        let rendered = buffer.render();
        assert_eq!(rendered, "hello world\n\n\x1b[0m");
    }

    #[test]
    fn test_render_is_idempotent_without_writes() {
        let buffer = TerminalBuffer::with_size(4, 20);
        buffer.write(b"some output");

        let first = buffer.render();
        let second = buffer.render();
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_returns_original_length() {
        let buffer = TerminalBuffer::new();
        let input = b"\x1b]8;;https://example.com\x1b\\link text\x1b]8;;\x1b\\";
        assert_eq!(buffer.write(input), input.len());
    }

    #[test]
    fn test_osc8_sequences_are_stripped() {
        let buffer = TerminalBuffer::with_size(2, 40);
        // Anchor text wrapped in OSC 8 open/close, ST terminated
        buffer.write(b"\x1b]8;;https://example.com\x1b\\click here\x1b]8;;\x1b\\");

        let rendered = buffer.render();
        assert!(rendered.contains("click here"));
        assert!(!rendered.contains("\x1b]8;"));
        assert!(!rendered.contains("example.com"));
    }

    #[test]
    fn test_osc8_bel_terminated_is_stripped() {
        let buffer = TerminalBuffer::with_size(2, 40);
        buffer.write(b"\x1b]8;;https://example.com\x07anchor\x1b]8;;\x07");

        let rendered = buffer.render();
        assert!(rendered.contains("anchor"));
        assert!(!rendered.contains("\x1b]8;"));
    }

    #[test]
    fn test_colored_output_uses_truecolor() {
        let buffer = TerminalBuffer::with_size(2, 40);
        // Red foreground via the basic palette
        buffer.write(b"\x1b[31mred\x1b[0m plain");

        let rendered = buffer.render();
        assert!(rendered.contains("38;2;205;0;0"), "got: {rendered:?}");
        assert!(rendered.contains("red"));
        assert!(rendered.contains("plain"));
        assert!(rendered.ends_with("\x1b[0m"));
    }

    #[test]
    fn test_resize_noop_keeps_cache() {
        let buffer = TerminalBuffer::with_size(4, 20);
        buffer.write(b"content");
        let before = buffer.render();

        buffer.resize(4, 20);
        assert_eq!(buffer.render(), before);
    }

    #[test]
    fn test_resize_changes_dimensions() {
        let buffer = TerminalBuffer::with_size(4, 20);
        buffer.resize(10, 50);
        assert_eq!(buffer.size(), (10, 50));
    }

    #[test]
    fn test_reset_clears_content() {
        let buffer = TerminalBuffer::with_size(4, 20);
        buffer.write(b"old content");
        buffer.reset();

        let rendered = buffer.render();
        assert!(!rendered.contains("old content"));
    }

    #[test]
    fn test_idx_to_rgb_cube_and_grayscale() {
        // 16 is the first cube entry: pure black
        assert_eq!(idx_to_rgb(16), (0, 0, 0));
        // 231 is the last cube entry: white
        assert_eq!(idx_to_rgb(231), (255, 255, 255));
        // 232 begins the grayscale ramp
        assert_eq!(idx_to_rgb(232), (8, 8, 8));
        assert_eq!(idx_to_rgb(255), (238, 238, 238));
    }
}
