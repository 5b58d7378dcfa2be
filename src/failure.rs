//! Reporting of symbolization failures.
//!
//! Failures never abort a run. Each one is recorded as a
//! [`FailureRecord`] and, at the end of a run, appended to a tab
//! separated report file.

use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::OpenOptions;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::log::info;
use crate::util::sanitize_field;
use crate::ErrorExt as _;
use crate::Result;


/// The default file name of the failure report.
pub const FAILURE_REPORT_NAME: &str = "failed_symbolization.tsv";

/// The header line of the failure report.
const HEADER: &str = "orig_elf\toffset\tbuild_id\ttarget_elf\treason";


/// The stage a failure occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// No debug binary could be found for an object.
    Resolution,
    /// The symbol backend failed or returned unusable output.
    Backend,
    /// Symbolized output could not be spliced into a log.
    Merge,
}

impl FailureKind {
    /// A textual representation of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Backend => "backend",
            Self::Merge => "merge",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}


/// A single recorded failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    /// The object path as recorded in the log or, for merge failures,
    /// the path of the log file.
    pub object_path: String,
    /// The normalized offset, if the failure concerns one.
    pub offset: Option<String>,
    /// The build ID used, if any.
    pub build_id: Option<String>,
    /// The file handed to the symbol backend, if it got that far.
    pub resolved_target: Option<PathBuf>,
    /// The stage the failure occurred in.
    pub kind: FailureKind,
    /// A human readable reason.
    pub reason: String,
}

impl FailureRecord {
    /// Format the record as a report line, without line terminator.
    fn to_tsv(&self) -> String {
        let target = self
            .resolved_target
            .as_ref()
            .map(|target| target.display().to_string())
            .unwrap_or_default();
        let fields = [
            sanitize_field(&self.object_path),
            sanitize_field(self.offset.as_deref().unwrap_or("")),
            sanitize_field(self.build_id.as_deref().unwrap_or("")),
            sanitize_field(&target),
            sanitize_field(&self.reason),
        ];
        fields.join("\t")
    }
}


fn write_records<W>(mut writer: W, header: bool, records: &[FailureRecord]) -> io::Result<()>
where
    W: Write,
{
    if header {
        let () = writeln!(writer, "{HEADER}")?;
    }
    for record in records {
        let () = writeln!(writer, "{}", record.to_tsv())?;
    }
    writer.flush()
}


/// Append `records` to the report at `path`.
///
/// The header line is written only if the file is created. Nothing is
/// done if there are no records.
pub fn write_report(path: &Path, records: &[FailureRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(())
    }

    let new = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open failure report {}", path.display()))?;

    let () = write_records(BufWriter::new(file), new, records)
        .with_context(|| format!("failed to write failure report {}", path.display()))?;

    info!(
        "recorded {} failure(s) in {}",
        records.len(),
        path.display()
    );
    Ok(())
}
