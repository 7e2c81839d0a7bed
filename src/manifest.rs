//! CSV manifest of one run's ledger, plus the end-of-run tally.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::protocol::{AcquisitionResult, AcquisitionStatus};

pub const MANIFEST_HEADER: [&str; 7] = [
    "country",
    "fruit",
    "saved_as",
    "image_url",
    "status",
    "content_type",
    "tried_titles",
];

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn write_row<W: Write>(mut w: W, row: &[&str]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            w.write_all(b",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            w.write_all(cell.as_bytes())?;
        }
    }
    w.write_all(b"\r\n")
}

/// Header plus one row per ledger entry, in ledger order.
pub fn write_manifest<W: Write>(mut w: W, ledger: &[AcquisitionResult]) -> io::Result<()> {
    write_row(&mut w, &MANIFEST_HEADER)?;
    for result in ledger {
        let tried_titles = result.tried_titles_joined();
        let row: [&str; 7] = [
            result.subject.country_name.as_str(),
            result.subject.fruit_name.as_str(),
            result.saved_as.as_str(),
            result.image_url.as_str(),
            result.status.as_tag(),
            result.detail.as_str(),
            tried_titles.as_str(),
        ];
        write_row(&mut w, &row)?;
    }
    w.flush()
}

/// Replaces any previous manifest at `path` via a temp file and a rename.
pub fn save_manifest(path: &Path, ledger: &[AcquisitionResult]) -> io::Result<()> {
    let mut buf = Vec::new();
    write_manifest(&mut buf, ledger)?;
    let temp_path = path.with_extension("csv.tmp");
    fs::write(&temp_path, &buf)?;
    if let Err(error) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }
    Ok(())
}

/// Counts shown after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ok: usize,
    pub degraded: usize,
    pub not_found: usize,
    /// (country, fruit, status) for everything neither ok nor not_found.
    pub other: Vec<(String, String, String)>,
}

impl RunSummary {
    pub fn from_ledger(ledger: &[AcquisitionResult]) -> Self {
        let mut summary = Self::default();
        for result in ledger {
            match &result.status {
                AcquisitionStatus::Ok => {
                    summary.ok += 1;
                    if result.is_degraded() {
                        summary.degraded += 1;
                    }
                }
                AcquisitionStatus::NotFound => summary.not_found += 1,
                AcquisitionStatus::Failed(tag) => summary.other.push((
                    result.subject.country_name.clone(),
                    result.subject.fruit_name.clone(),
                    tag.clone(),
                )),
            }
        }
        summary
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "Downloaded OK: {} (saved raw: {}) | Not found: {} | Other: {}",
            self.ok,
            self.degraded,
            self.not_found,
            self.other.len()
        );
        if !self.other.is_empty() {
            out.push_str("\nOther statuses encountered:");
            for (country, fruit, status) in &self.other {
                out.push_str(&format!("\n - {country} / {fruit}: {status}"));
            }
        }
        out
    }
}
