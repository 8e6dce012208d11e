//! Terminal progress rendering
//!
//! Turns successive `SessionState` snapshots into append-only output: one line
//! per stage transition, and live text written as it grows.

use crossterm::style::Stylize;
use std::io::{self, Write};
use tubelens_core::{SessionState, StageStatus};
use uuid::Uuid;

pub struct ProgressRenderer<W: Write> {
    out: W,
    color: bool,
    session_id: Option<Uuid>,
    statuses: Vec<StageStatus>,
    /// Bytes of `live_text` already written
    printed: usize,
    line_open: bool,
}

impl<W: Write> ProgressRenderer<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self {
            out,
            color,
            session_id: None,
            statuses: Vec::new(),
            printed: 0,
            line_open: false,
        }
    }

    /// Write whatever changed since the previous snapshot
    pub fn render(&mut self, state: &SessionState) -> io::Result<()> {
        if state.session_id.is_none() {
            return Ok(());
        }
        if state.session_id != self.session_id {
            self.session_id = state.session_id;
            self.statuses = vec![StageStatus::Pending; state.stages.stages().len()];
            self.printed = 0;
            self.end_live_line()?;
        }

        for (idx, stage) in state.stages.stages().iter().enumerate() {
            if self.statuses.get(idx) == Some(&stage.status) {
                continue;
            }
            self.end_live_line()?;
            let marker = self.marker(stage.status);
            writeln!(self.out, "{} {}", marker, stage.definition.label)?;
            if let Some(slot) = self.statuses.get_mut(idx) {
                *slot = stage.status;
            }
        }

        if state.live_text.len() > self.printed {
            if let Some(delta) = state.live_text.get(self.printed..) {
                write!(self.out, "{}", delta)?;
                self.printed = state.live_text.len();
                self.line_open = true;
            }
        } else if state.live_text.is_empty() {
            self.printed = 0;
            self.end_live_line()?;
        }

        self.out.flush()
    }

    /// Terminate a partially written live-text line
    fn end_live_line(&mut self) -> io::Result<()> {
        if self.line_open {
            writeln!(self.out)?;
            self.line_open = false;
        }
        Ok(())
    }

    fn marker(&self, status: StageStatus) -> String {
        let plain = match status {
            StageStatus::Pending => "[ ]",
            StageStatus::Active => "[>]",
            StageStatus::Completed => "[x]",
            StageStatus::Error => "[!]",
        };
        if !self.color {
            return plain.to_string();
        }
        match status {
            StageStatus::Pending => plain.dark_grey().to_string(),
            StageStatus::Active => plain.cyan().to_string(),
            StageStatus::Completed => plain.green().to_string(),
            StageStatus::Error => plain.red().to_string(),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
