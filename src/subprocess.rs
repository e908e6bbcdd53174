//! Command lines for the external tools the agent drives, plus the bounded
//! diagnostic excerpts attached to their failures.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

/// Upper bound on the stderr excerpt carried by subprocess errors.
pub const DEFAULT_STDERR_LIMIT: usize = 4096;

/// A program plus its arguments, kept as plain strings so it can be logged
/// and templated before it turns into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Copy of the command with a file path appended as the last argument.
    pub fn with_path(&self, path: &Path) -> Self {
        let mut cmd = self.clone();
        cmd.args.push(path.to_string_lossy().into_owned());
        cmd
    }

    /// A tokio command with stdin closed and both output streams piped.
    pub fn to_piped_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.program)?;
        for arg in &self.args {
            write!(f, " {:?}", arg)?;
        }
        Ok(())
    }
}

/// Keeps the last `limit` bytes of a stream.
#[derive(Debug)]
pub struct BoundedTail {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedTail {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(DEFAULT_STDERR_LIMIT)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }

    /// Lossy text of the retained bytes, marked when earlier output was lost.
    pub fn into_excerpt(self) -> String {
        let text = String::from_utf8_lossy(&self.buf);
        let text = text.trim();
        if self.truncated {
            format!("...{}", text)
        } else {
            text.to_string()
        }
    }
}

/// Excerpt of the tail of an already collected output.
pub fn excerpt(data: &[u8], limit: usize) -> String {
    let mut tail = BoundedTail::new(limit);
    tail.push(data);
    tail.into_excerpt()
}
