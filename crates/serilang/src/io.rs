//! Stream configuration for an embedded VM.
//!
//! A [`Console`] bundles the stdout/stdin/stderr of a VM so embedders can
//! capture or redirect script I/O. [`StdConsole`] (the default) talks to the
//! process streams; [`CollectConsole`] buffers everything in memory and is
//! what the test suite uses.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, BufRead as _, Write as _},
    rc::Rc,
};

use crate::error::{RunError, RunResult};

/// Abstraction over the VM's standard streams.
pub trait Console {
    /// Writes a chunk of text to script stdout. No separators or newlines
    /// are added; `print` emits those itself.
    fn stdout_write(&mut self, text: &str) -> RunResult<()>;

    /// Writes a chunk of text to script stderr. Used for uncaught fiber
    /// errors.
    fn stderr_write(&mut self, text: &str) -> RunResult<()>;

    /// Reads one line from script stdin, without the trailing newline.
    fn stdin_read_line(&mut self) -> RunResult<String>;

    /// Flushes buffered stdout, if any.
    fn flush(&mut self) -> RunResult<()> {
        Ok(())
    }
}

fn io_error(err: &io::Error) -> RunError {
    RunError::runtime(format!("i/o error: {err}"))
}

/// Default console wired to the process streams.
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn stdout_write(&mut self, text: &str) -> RunResult<()> {
        io::stdout().write_all(text.as_bytes()).map_err(|e| io_error(&e))
    }

    fn stderr_write(&mut self, text: &str) -> RunResult<()> {
        io::stderr().write_all(text.as_bytes()).map_err(|e| io_error(&e))
    }

    fn stdin_read_line(&mut self) -> RunResult<String> {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map_err(|e| io_error(&e))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    fn flush(&mut self) -> RunResult<()> {
        io::stdout().flush().map_err(|e| io_error(&e))
    }
}

/// In-memory console for tests and captured embedding.
///
/// Output buffers are shared handles so the embedder can keep reading them
/// after handing the console to the VM.
#[derive(Debug, Default)]
pub struct CollectConsole {
    stdout: Rc<RefCell<String>>,
    stderr: Rc<RefCell<String>>,
    stdin: VecDeque<String>,
}

impl CollectConsole {
    /// Creates an empty console with no stdin content.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues lines to be served by `stdin_read_line`.
    pub fn push_stdin(&mut self, line: impl Into<String>) {
        self.stdin.push_back(line.into());
    }

    /// Shared handle onto everything written to stdout.
    #[must_use]
    pub fn stdout_handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.stdout)
    }

    /// Shared handle onto everything written to stderr.
    #[must_use]
    pub fn stderr_handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.stderr)
    }
}

impl Console for CollectConsole {
    fn stdout_write(&mut self, text: &str) -> RunResult<()> {
        self.stdout.borrow_mut().push_str(text);
        Ok(())
    }

    fn stderr_write(&mut self, text: &str) -> RunResult<()> {
        self.stderr.borrow_mut().push_str(text);
        Ok(())
    }

    fn stdin_read_line(&mut self) -> RunResult<String> {
        self.stdin
            .pop_front()
            .ok_or_else(|| RunError::runtime("end of input"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_console_buffers_output() {
        let mut console = CollectConsole::new();
        let out = console.stdout_handle();
        console.stdout_write("a").unwrap();
        console.stdout_write("b").unwrap();
        assert_eq!(out.borrow().as_str(), "ab");
    }

    #[test]
    fn collect_console_serves_queued_stdin() {
        let mut console = CollectConsole::new();
        console.push_stdin("hello");
        assert_eq!(console.stdin_read_line().unwrap(), "hello");
        assert!(console.stdin_read_line().is_err());
    }
}
