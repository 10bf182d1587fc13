//! Operator confirmation between memory acquisition and DMA mapping.

use crate::error::{DmaPassError, Result};
use std::io::{BufRead, Write};
use tracing::info;

/// Synchronous suspension point of a session.
pub trait ConfirmationGate {
    /// Block until the operator allows the session to continue.
    fn confirm(&mut self, prompt: &str) -> Result<()>;
}

/// Prints the prompt and waits for one line of input.
///
/// End of input aborts the session.
pub struct LineGate<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LineGate<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl LineGate<std::io::StdinLock<'static>, std::io::Stderr> {
    /// Gate on the process's standard input.
    pub fn stdin() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stderr())
    }
}

impl<R: BufRead, W: Write> ConfirmationGate for LineGate<R, W> {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        let aborted = |e: std::io::Error| DmaPassError::Aborted { reason: e.to_string() };

        write!(self.output, "{} (press enter to continue) ", prompt).map_err(aborted)?;
        self.output.flush().map_err(aborted)?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(aborted)?;
        if read == 0 {
            let reason = "end of input at confirmation prompt".to_string();
            return Err(DmaPassError::Aborted { reason });
        }
        Ok(())
    }
}

/// Never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl ConfirmationGate for AutoConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        info!(prompt, "Confirmation skipped");
        Ok(())
    }
}
