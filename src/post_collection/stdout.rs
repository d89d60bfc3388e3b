//! Prints one CSV-like row per reading.

use std::io::{self, Write};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;

use super::payload;
use crate::{
    module::PostCollection,
    outcome::{ModuleError, Outcome},
    store::Reading,
};

pub const KIND: &str = "stdout";

#[derive(Debug, Clone, Deserialize)]
pub struct StdoutSettings {
    #[serde(default = "payload::default_fields")]
    pub fields: Vec<String>,
}

pub struct StdoutSink<W: Write + Send> {
    out: W,
    columns: usize,
}

impl StdoutSink<io::Stdout> {
    pub fn new(settings: &StdoutSettings) -> Result<Self, ModuleError> {
        Self::with_writer(settings, io::stdout())
    }
}

impl<W: Write + Send> StdoutSink<W> {
    /// Writes the header row immediately.
    pub fn with_writer(settings: &StdoutSettings, mut out: W) -> Result<Self, ModuleError> {
        writeln!(out, "{:>19}, {}", "Datetime", settings.fields.join(", "))
            .and_then(|()| out.flush())
            .map_err(|e| ModuleError::sink(format!("{KIND}: {e}")))?;
        Ok(Self {
            out,
            columns: settings.fields.len(),
        })
    }

    fn row(&mut self, reading: &Reading, now: DateTime<Utc>) -> io::Result<()> {
        let stamp = reading.recorded_at.unwrap_or(now).with_timezone(&Local);
        let cells: Vec<String> = reading
            .values()
            .take(self.columns)
            .map(|v| format!("{v:>8.3}"))
            .collect();
        writeln!(self.out, "{}, {}", stamp.format("%Y-%m-%dT%H:%M:%S"), cells.join(", "))?;
        self.out.flush()
    }
}

#[async_trait]
impl<W: Write + Send> PostCollection for StdoutSink<W> {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self, reading: &Reading) -> Outcome {
        self.row(reading, Utc::now())
            .map_err(|e| ModuleError::sink(format!("{KIND}: {e}")))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn header_then_rows() {
        let settings = StdoutSettings {
            fields: vec!["temp_celsius".into(), "relative_humidity".into()],
        };
        let mut sink = StdoutSink::with_writer(&settings, Vec::new()).unwrap();
        let reading = Reading {
            primary: 23.5,
            secondary: vec![41.42, 1.0],
            valid: true,
            updated_at: None,
            recorded_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 2, 3, 4).unwrap()),
        };
        assert!(sink.step(&reading).await.is_success());

        let text = String::from_utf8(sink.out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "           Datetime, temp_celsius, relative_humidity");
        assert!(lines[1].ends_with("  23.500,   41.420"), "row {:?}", lines[1]);
    }
}
