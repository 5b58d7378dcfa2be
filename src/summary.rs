//! A summary of the objects referenced by crash logs and their build
//! IDs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::elf::read_build_id;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::warn;
use crate::parse::StackTrace;
use crate::resolve::Rootfs;
use crate::util::hex_string;
use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// Build ID information about a single object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildIdSummary {
    /// The object path, as recorded in the log.
    pub path: String,
    /// The build ID recorded in the log, if any.
    pub log_build_id: Option<String>,
    /// The build ID read from the object inside the root file system,
    /// if it got read.
    pub found_build_id: Option<String>,
    /// Whether the build IDs from log and root file system differ.
    pub mismatch: bool,
}

impl BuildIdSummary {
    /// The build ID to use for lookups: the one from the log or, lacking
    /// that, the one found in the root file system.
    pub fn effective_build_id(&self) -> Option<&str> {
        self.log_build_id
            .as_deref()
            .or(self.found_build_id.as_deref())
    }

    /// Tags describing where the build ID information came from.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if self.log_build_id.is_some() {
            let () = tags.push("LOG");
        }
        if self.log_build_id.is_none() && self.found_build_id.is_some() {
            let () = tags.push("FOUND");
        }
        if self.mismatch {
            let () = tags.push("MISMATCH");
        }
        tags
    }

    /// Format the entry as a human readable line.
    pub fn to_line(&self) -> String {
        let build_id = self.effective_build_id().unwrap_or("None");
        let tags = self.tags();
        let mut line = format!("{:<60}  BuildId: {build_id}", self.path);
        if !tags.is_empty() {
            line += "  ";
            line += &tags.join(",");
        }
        line
    }
}


#[derive(Serialize)]
struct Row<'summary> {
    path: &'summary str,
    log_build_id: Option<&'summary str>,
    found_build_id: Option<&'summary str>,
    effective_build_id: Option<&'summary str>,
    mismatch: bool,
    tags: String,
}

impl<'summary> From<&'summary BuildIdSummary> for Row<'summary> {
    fn from(summary: &'summary BuildIdSummary) -> Self {
        Self {
            path: &summary.path,
            log_build_id: summary.log_build_id.as_deref(),
            found_build_id: summary.found_build_id.as_deref(),
            effective_build_id: summary.effective_build_id(),
            mismatch: summary.mismatch,
            tags: summary.tags().join(","),
        }
    }
}


fn read_object_build_id(rootfs: &Rootfs, path: &str) -> Option<String> {
    let (file, _meta) = rootfs.find_file(Path::new(path))?;
    let result = ElfParser::open(&file).and_then(|parser| read_build_id(&parser));
    match result {
        Ok(build_id) => build_id.map(|build_id| hex_string(&build_id)),
        Err(err) => {
            debug!("failed to read build ID of {}: {err:#}", file.display());
            None
        }
    }
}


/// Summarize the objects referenced by `traces`, sorted by path.
///
/// If a root file system is provided, build IDs are read from the
/// objects inside of it for entries the log has no build ID for. With
/// `check_mismatch` set they are read for every entry and compared
/// against the ones from the log.
pub fn summarize<'trace, I>(
    traces: I,
    rootfs: Option<&Rootfs>,
    check_mismatch: bool,
) -> Vec<BuildIdSummary>
where
    I: IntoIterator<Item = &'trace StackTrace>,
{
    let mut entries = BTreeMap::<String, BuildIdSummary>::new();
    for frame in traces.into_iter().flat_map(|trace| trace.frames.iter()) {
        let path = match frame.object_path() {
            Some(path) => path,
            None => continue,
        };
        let entry = entries
            .entry(path.to_string())
            .or_insert_with(|| BuildIdSummary {
                path: path.to_string(),
                ..Default::default()
            });
        if entry.log_build_id.is_none() {
            entry.log_build_id = frame.build_id.clone();
        }
    }

    if let Some(rootfs) = rootfs {
        for entry in entries.values_mut() {
            if entry.log_build_id.is_some() && !check_mismatch {
                continue
            }

            entry.found_build_id = read_object_build_id(rootfs, &entry.path);
            if let (Some(log), Some(found)) = (&entry.log_build_id, &entry.found_build_id) {
                if check_mismatch && !log.eq_ignore_ascii_case(found) {
                    warn!(
                        "build ID mismatch for {}: log reports {log}, binary contains {found}",
                        entry.path
                    );
                    entry.mismatch = true;
                }
            }
        }
    }

    entries.into_values().collect()
}

/// Render `summaries` as a JSON array.
pub fn to_json(summaries: &[BuildIdSummary]) -> Result<String> {
    let rows = summaries.iter().map(Row::from).collect::<Vec<_>>();
    serde_json::to_string_pretty(&rows).map_err(Error::with_invalid_data)
}

/// Write `summaries` as a JSON array to the file at `path`.
pub fn write_json(path: &Path, summaries: &[BuildIdSummary]) -> Result<()> {
    let json = to_json(summaries)?;
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let () = writeln!(writer, "{json}")
        .and_then(|()| writer.flush())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::create_dir_all;
    use std::fs::read_to_string;
    use std::fs::write;

    use serde_json::Value;
    use tempfile::tempdir;
    use test_log::test;

    use crate::elf::types::SHT_NOTE;
    use crate::parse::parse;
    use crate::test_helper::build_id_note;
    use crate::test_helper::elf_with_sections;
    use crate::test_helper::ElfClass;


    const LOG: &str = "\
#0 0x10 (/usr/lib64/libfoo.so+0x10) (build-id:aa0d6e)
#1 0x20 (/usr/bin/app+0x20)
#2 0x30 (/usr/lib64/libbar.so+0x30) (build-id:bb11)
#3 0x40 (/usr/lib64/libfoo.so+0x40)
#4 0x50 in main
";


    /// Check derived values and line formatting.
    #[test]
    fn entry_formatting() {
        let entry = BuildIdSummary {
            path: "/usr/lib64/libfoo.so".to_string(),
            log_build_id: None,
            found_build_id: Some("cafe".to_string()),
            mismatch: false,
        };
        assert_eq!(entry.effective_build_id(), Some("cafe"));
        assert_eq!(entry.tags(), ["FOUND"]);
        assert_eq!(
            entry.to_line(),
            format!("{:<60}  BuildId: cafe  FOUND", "/usr/lib64/libfoo.so")
        );

        let entry = BuildIdSummary {
            path: "/usr/bin/app".to_string(),
            ..Default::default()
        };
        assert_eq!(entry.tags(), Vec::<&str>::new());
        assert!(entry.to_line().ends_with("  BuildId: None"));
        assert_eq!(entry.to_line().len(), 60 + "  BuildId: None".len());
    }

    /// Check that build IDs get collected from logs and the root file
    /// system.
    #[test]
    fn summary_collection() {
        let dir = tempdir().unwrap();
        let note = build_id_note(&[0xbb, 0x22]);
        let image = elf_with_sections(
            ElfClass::Elf64,
            &[(".note.gnu.build-id", SHT_NOTE, note.as_slice())],
        );
        let note = build_id_note(&[0xca, 0xfe]);
        let app = elf_with_sections(
            ElfClass::Elf32,
            &[(".note.gnu.build-id", SHT_NOTE, note.as_slice())],
        );
        let () = create_dir_all(dir.path().join("usr/lib64")).unwrap();
        let () = create_dir_all(dir.path().join("usr/bin")).unwrap();
        let () = write(dir.path().join("usr/lib64/libbar.so"), image).unwrap();
        let () = write(dir.path().join("usr/bin/app"), app).unwrap();

        let log = parse(LOG);
        let summaries = summarize(&log.traces, None, false);
        let paths = summaries
            .iter()
            .map(|entry| entry.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            ["/usr/bin/app", "/usr/lib64/libbar.so", "/usr/lib64/libfoo.so"]
        );
        assert_eq!(summaries[2].log_build_id.as_deref(), Some("aa0d6e"));
        assert!(summaries.iter().all(|entry| entry.found_build_id.is_none()));

        let rootfs = Rootfs::new(dir.path());
        let summaries = summarize(&log.traces, Some(&rootfs), false);
        assert_eq!(summaries[0].found_build_id.as_deref(), Some("cafe"));
        assert_eq!(summaries[0].tags(), ["FOUND"]);
        assert_eq!(summaries[1].found_build_id, None);
        assert!(!summaries[1].mismatch);

        let summaries = summarize(&log.traces, Some(&rootfs), true);
        assert_eq!(summaries[1].found_build_id.as_deref(), Some("bb22"));
        assert!(summaries[1].mismatch);
        assert_eq!(summaries[1].tags(), ["LOG", "MISMATCH"]);
        // No binary, no mismatch.
        assert!(!summaries[2].mismatch);
    }

    /// Check the JSON representation.
    #[test]
    fn json_output() {
        let summaries = [BuildIdSummary {
            path: "/usr/lib64/libfoo.so".to_string(),
            log_build_id: Some("aa".to_string()),
            found_build_id: Some("bb".to_string()),
            mismatch: true,
        }];

        let dir = tempdir().unwrap();
        let path = dir.path().join("buildids.json");
        let () = write_json(&path, &summaries).unwrap();
        let value = serde_json::from_str::<Value>(&read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{
                "path": "/usr/lib64/libfoo.so",
                "log_build_id": "aa",
                "found_build_id": "bb",
                "effective_build_id": "aa",
                "mismatch": true,
                "tags": "LOG,MISMATCH",
            }])
        );
    }
}
