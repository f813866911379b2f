use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunReport};
use crate::domain::IdentifierState;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Summary,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable run summary written to stdout.
pub struct SummaryOutput;

impl SummaryOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        let mut stdout = io::stdout();
        Self::write_report(&mut stdout, report)
    }

    pub fn write_report(out: &mut dyn Write, report: &RunReport) -> io::Result<()> {
        if report.dry_run {
            writeln!(out, "Dry run ({}), nothing was contacted.", report.tool)?;
            for stage in &report.stages {
                writeln!(out, "stage {}:", stage.stage)?;
                for (index, shard) in stage.shards.iter().enumerate() {
                    writeln!(out, "  shard {index}: {}", shard.join(", "))?;
                }
            }
            return Ok(());
        }

        writeln!(
            out,
            "{} identifiers processed, {} failed.",
            report.identifiers.len(),
            report.failures()
        )?;
        for state in [
            IdentifierState::Downloaded,
            IdentifierState::Transformed,
            IdentifierState::TransformFallbackRaw,
            IdentifierState::TransformSkipped,
            IdentifierState::Resolved,
            IdentifierState::ResolutionError,
            IdentifierState::UnresolvedLocation,
            IdentifierState::DownloadError,
        ] {
            let count = report.count(state);
            if count > 0 {
                writeln!(out, "  {state}: {count}")?;
            }
        }
        for entry in report.identifiers.iter().filter(|entry| entry.state.is_failure()) {
            writeln!(
                out,
                "  ! {} ({}): {}",
                entry.oid,
                entry.state,
                entry.message.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}

/// Prints phase transitions on stderr while a run is in progress.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let phase = event
            .message
            .split(';')
            .next()
            .and_then(|part| part.strip_prefix("phase="))
            .unwrap_or(&event.message);
        match event.elapsed {
            Some(elapsed) => eprintln!("[{phase}] done in {:.1}s", elapsed.as_secs_f64()),
            None => eprintln!("[{phase}]"),
        }
    }
}
