// Completion text comes from a remote service and is painted straight into the
// terminal, so escape sequences and control characters are stripped first.

const MAX_LINE_CHARS: usize = 4096;
const MAX_TEXT_CHARS: usize = 64 * 1024;

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

struct Stripper {
    mode: Option<EscapeMode>,
}

impl Stripper {
    fn new() -> Self {
        Self { mode: None }
    }

    // Returns true when `c` is part of an escape sequence and must be dropped.
    fn swallow(&mut self, c: char) -> bool {
        if let Some(mode) = self.mode.as_ref() {
            match mode {
                EscapeMode::Esc => match c {
                    '[' => self.mode = Some(EscapeMode::Csi),
                    ']' => self.mode = Some(EscapeMode::Osc),
                    'P' | 'X' | '^' | '_' => self.mode = Some(EscapeMode::StTerminated),
                    _ => self.mode = None,
                },
                EscapeMode::Csi => {
                    if ('@'..='~').contains(&c) {
                        self.mode = None;
                    }
                }
                EscapeMode::Osc => {
                    if c == '\x07' {
                        self.mode = None;
                    } else if c == '\x1b' {
                        self.mode = Some(EscapeMode::OscEsc);
                    }
                }
                EscapeMode::OscEsc => {
                    if c == '\\' {
                        self.mode = None;
                    } else if c != '\x1b' {
                        self.mode = Some(EscapeMode::Osc);
                    }
                }
                EscapeMode::StTerminated => {
                    if c == '\x1b' {
                        self.mode = Some(EscapeMode::StEsc);
                    }
                }
                EscapeMode::StEsc => {
                    if c == '\\' {
                        self.mode = None;
                    } else if c != '\x1b' {
                        self.mode = Some(EscapeMode::StTerminated);
                    }
                }
            }
            return true;
        }
        if c == '\x1b' {
            self.mode = Some(EscapeMode::Esc);
            return true;
        }
        false
    }
}

impl Stripper {
    // Appends the cleaned form of `c` to `out`; false when nothing was kept.
    fn clean_into(&mut self, c: char, keep_newlines: bool, out: &mut String) -> bool {
        if self.swallow(c) {
            return false;
        }
        match c {
            '\r' => return false,
            '\n' if keep_newlines => out.push('\n'),
            '\n' | '\t' => out.push(' '),
            c if c.is_control() || is_format_control(c) => return false,
            c => out.push(c),
        }
        true
    }
}

fn sanitize_with(
    stripper: &mut Stripper,
    input: &str,
    keep_newlines: bool,
    max_chars: usize,
) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut char_count = 0usize;
    let mut truncated = false;

    for c in input.chars() {
        if !stripper.clean_into(c, keep_newlines, &mut out) {
            continue;
        }
        if char_count == max_chars {
            out.pop();
            truncated = true;
            break;
        }
        char_count += 1;
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }
    out
}

fn sanitize(input: &str, keep_newlines: bool, max_chars: usize) -> String {
    sanitize_with(&mut Stripper::new(), input, keep_newlines, max_chars)
}

/// Multi-line sanitizer for text that arrives in pieces. An escape sequence
/// split across two chunks is still dropped whole.
pub struct TextStream {
    stripper: Stripper,
}

impl TextStream {
    pub fn new() -> Self {
        Self {
            stripper: Stripper::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> String {
        sanitize_with(&mut self.stripper, chunk, true, MAX_TEXT_CHARS)
    }
}

impl Default for TextStream {
    fn default() -> Self {
        Self::new()
    }
}

// Single-line form for status lines and task previews.
pub fn sanitize_log_line(input: &str) -> String {
    sanitize(input, false, MAX_LINE_CHARS)
}

// Multi-line form for completion bodies; line breaks survive.
pub fn sanitize_text(input: &str) -> String {
    sanitize(input, true, MAX_TEXT_CHARS)
}

fn is_format_control(c: char) -> bool {
    ('\u{202A}'..='\u{202E}').contains(&c) || ('\u{2066}'..='\u{2069}').contains(&c)
}
