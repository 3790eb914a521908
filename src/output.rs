use std::io::{self, Write};

use serde::Serialize;

use crate::catalog::RemoteListing;
use crate::pull::{ProgressEvent, ProgressSink, PullReport};
use crate::registry::{AliasUpdate, Listing, PruneReport};
use crate::seqcol::Comparison;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_pull(report: &PullReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_listing(listing: &Listing) -> io::Result<()> {
        Self::print_json(listing)
    }

    pub fn print_remote(listings: &[RemoteListing]) -> io::Result<()> {
        Self::print_json(&listings)
    }

    pub fn print_comparison(comparison: &Comparison) -> io::Result<()> {
        Self::print_json(comparison)
    }

    pub fn print_aliases(update: &AliasUpdate) -> io::Result<()> {
        Self::print_json(update)
    }

    pub fn print_prune(report: &PruneReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_value<T: Serialize>(value: &T) -> io::Result<()> {
        Self::print_json(value)
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

/// Progress lines on stderr, for terminals.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "[{:>6.1}s] {}", elapsed.as_secs_f64(), event.message),
            None => writeln!(stderr, "          {}", event.message),
        };
    }
}
