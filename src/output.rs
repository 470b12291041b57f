use crossterm::style::Stylize;
use std::fmt::Display;
use std::io::{self, IsTerminal, Write};

/// User-facing status lines. Progress and milestones go to stdout, errors to stderr.
pub struct Reporter {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    color: bool,
}

impl Reporter {
    pub fn stdio() -> Self {
        let color = io::stdout().is_terminal() && io::stderr().is_terminal();
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()), color)
    }

    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>, color: bool) -> Self {
        Self { out, err, color }
    }

    pub fn plain(&mut self, message: impl Display) {
        let _ = writeln!(self.out, "{}", message);
    }

    pub fn progress(&mut self, message: impl Display) {
        let line = message.to_string();
        if self.color {
            let _ = writeln!(self.out, "{}", line.yellow());
        } else {
            let _ = writeln!(self.out, "{}", line);
        }
    }

    pub fn success(&mut self, message: impl Display) {
        let line = message.to_string();
        if self.color {
            let _ = writeln!(self.out, "{}", line.green());
        } else {
            let _ = writeln!(self.out, "{}", line);
        }
    }

    pub fn error(&mut self, message: impl Display) {
        let line = message.to_string();
        if self.color {
            let _ = writeln!(self.err, "{}", line.red());
        } else {
            let _ = writeln!(self.err, "{}", line);
        }
    }
}
