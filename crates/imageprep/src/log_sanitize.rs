//! Strips terminal control sequences from child process output before it is
//! logged. Build tools (cmake, dotnet, apt) colorize freely.

const MAX_LOG_CHARS: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Esc,
    Csi,
    // OSC/DCS-like strings; `bel_ends` is true for OSC only.
    Str { bel_ends: bool },
    StrEsc { bel_ends: bool },
}

struct Sanitizer {
    state: State,
    out: String,
    chars: usize,
}

impl Sanitizer {
    fn new(cap: usize) -> Self {
        Self {
            state: State::Text,
            out: String::with_capacity(cap.min(MAX_LOG_CHARS)),
            chars: 0,
        }
    }

    // Returns false once the output is full.
    fn push(&mut self, c: char) -> bool {
        self.state = match self.state {
            State::Text => return self.push_text(c),
            State::Esc => match c {
                '[' => State::Csi,
                ']' => State::Str { bel_ends: true },
                'P' | 'X' | '^' | '_' => State::Str { bel_ends: false },
                _ => State::Text,
            },
            State::Csi if ('@'..='~').contains(&c) => State::Text,
            State::Csi => State::Csi,
            State::Str { bel_ends } if bel_ends && c == '\x07' => State::Text,
            State::Str { bel_ends } if c == '\x1b' => State::StrEsc { bel_ends },
            State::Str { bel_ends } => State::Str { bel_ends },
            State::StrEsc { .. } if c == '\\' => State::Text,
            State::StrEsc { bel_ends } if c == '\x1b' => State::StrEsc { bel_ends },
            State::StrEsc { bel_ends } => State::Str { bel_ends },
        };
        true
    }

    fn push_text(&mut self, c: char) -> bool {
        match c {
            '\x1b' => {
                self.state = State::Esc;
                return true;
            }
            '\r' | '\n' => return true,
            '\t' => self.out.push(' '),
            c if c.is_control() || is_format_control(c) => return true,
            c => self.out.push(c),
        }
        self.chars += 1;
        self.chars < MAX_LOG_CHARS
    }
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut s = Sanitizer::new(input.len());
    let mut truncated = false;
    for c in input.chars() {
        if !s.push(c) {
            truncated = true;
            break;
        }
    }
    if truncated {
        s.out.push_str(" ...[truncated]");
    }
    s.out
}

/// Sanitizes a multi-line blob (e.g. a test log) into non-empty lines.
pub fn sanitize_lines(input: &str) -> Vec<String> {
    input
        .lines()
        .map(sanitize_log_line)
        .filter(|l| !l.trim().is_empty())
        .collect()
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
