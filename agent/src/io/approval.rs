//! Operator prompts for the approval gate.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::gate::HumanResponse;
use crate::core::planning::ProposedCommand;
use crate::core::types::{Elevation, RiskVerdict};

/// Source of operator answers.
pub trait ApprovalPrompt {
    fn ask(&mut self, proposed: &ProposedCommand, verdict: &RiskVerdict) -> Result<HumanResponse>;
}

impl<T: ApprovalPrompt + ?Sized> ApprovalPrompt for Box<T> {
    fn ask(&mut self, proposed: &ProposedCommand, verdict: &RiskVerdict) -> Result<HumanResponse> {
        (**self).ask(proposed, verdict)
    }
}

/// Interactive prompt over a reader/writer pair (stdin/stderr in the CLI).
///
/// Accepts `y`, `n`, `r` (reject with a redirect message) and `q`. End of
/// input counts as quit.
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("read operator input")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> ApprovalPrompt for TerminalPrompt<R, W> {
    fn ask(&mut self, proposed: &ProposedCommand, verdict: &RiskVerdict) -> Result<HumanResponse> {
        writeln!(self.output).context("write prompt")?;
        match proposed.elevation {
            Elevation::None => writeln!(self.output, "Proposed command [{}]:", verdict.tier),
            Elevation::Sudo => writeln!(
                self.output,
                "Proposed command [{}] (runs elevated with sudo):",
                verdict.tier
            ),
        }
        .context("write prompt")?;
        writeln!(self.output, "  {}", proposed.command).context("write prompt")?;
        if !proposed.rationale.is_empty() {
            writeln!(self.output, "Rationale: {}", proposed.rationale).context("write prompt")?;
        }
        if !verdict.matched_rules.is_empty() {
            writeln!(
                self.output,
                "Rules: {} ({})",
                verdict.matched_rules.join(", "),
                verdict.rationale
            )
            .context("write prompt")?;
        }
        loop {
            write!(self.output, "Run it? [y]es / [n]o / [r]edirect / [q]uit: ")
                .context("write prompt")?;
            self.output.flush().context("flush prompt")?;
            let Some(answer) = self.read_line()? else {
                return Ok(HumanResponse::Quit);
            };
            match answer.to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(HumanResponse::Approve),
                "n" | "no" => return Ok(HumanResponse::Reject),
                "q" | "quit" => return Ok(HumanResponse::Quit),
                "r" | "redirect" => {
                    write!(self.output, "Guidance for the planner: ").context("write prompt")?;
                    self.output.flush().context("flush prompt")?;
                    let message = self.read_line()?.unwrap_or_default();
                    return Ok(HumanResponse::RejectWithMessage(message));
                }
                _ => writeln!(self.output, "Please answer y, n, r or q.").context("write prompt")?,
            }
        }
    }
}

/// Answers every prompt with a rejection. Used when no operator is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyPrompt;

impl ApprovalPrompt for DenyPrompt {
    fn ask(&mut self, _proposed: &ProposedCommand, verdict: &RiskVerdict) -> Result<HumanResponse> {
        Ok(HumanResponse::RejectWithMessage(format!(
            "No operator is available to approve {} commands; propose a lower-risk alternative.",
            verdict.tier
        )))
    }
}
