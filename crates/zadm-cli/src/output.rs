// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tab-separated or JSON command output

use serde_json::Value;
use std::io::Write;

pub struct Output<'w> {
    writer: &'w mut dyn Write,
    json: bool,
}

impl<'w> Output<'w> {
    pub fn new(writer: &'w mut dyn Write, json: bool) -> Self {
        Output { writer, json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Write `rows` as tab-separated lines, or `value` when JSON was asked
    /// for.
    pub fn emit(&mut self, rows: &[Vec<String>], value: Value) -> anyhow::Result<()> {
        if self.json {
            writeln!(self.writer, "{}", serde_json::to_string_pretty(&value)?)?;
        } else {
            for row in rows {
                writeln!(self.writer, "{}", row.join("\t"))?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Free text, dropped in JSON mode.
    pub fn note(&mut self, text: &str) -> anyhow::Result<()> {
        if !self.json && !text.is_empty() {
            write!(self.writer, "{}", text)?;
            if !text.ends_with('\n') {
                writeln!(self.writer)?;
            }
        }
        Ok(())
    }
}
