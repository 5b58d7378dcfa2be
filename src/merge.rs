//! Splicing of symbolized stack traces into the original log text.
//!
//! Everything but the frame lines of the stack traces is preserved
//! byte for byte, including line terminators.

use crate::cache::SymbolTable;
use crate::failure::FailureKind;
use crate::failure::FailureRecord;
use crate::log::debug;
use crate::log::warn;
use crate::parse::Frame;
use crate::parse::ParsedLog;
use crate::render::render;


/// The result of merging symbolized traces into a log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Merged {
    /// The merged text.
    pub text: String,
    /// The traces that could not be merged.
    pub failures: Vec<FailureRecord>,
}


/// Split a line as produced by `split_inclusive` into its contents and
/// its terminator.
fn split_eol(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}


/// Merge the symbolized traces of `log` into `original`, the text `log`
/// was parsed from.
///
/// Each trace is located by the exact text of its first frame. Its frame
/// lines get replaced by the rendered frames, and non-frame lines found
/// in between them follow the rendered block. If a trace cannot be
/// located, the remainder of the text is copied unchanged and the
/// failure is reported.
pub fn merge(original: &str, log: &ParsedLog, table: &SymbolTable) -> Merged {
    let mut text = String::with_capacity(original.len());
    let mut failures = Vec::new();
    let mut lines = original.split_inclusive('\n').map(split_eol);

    'traces: for trace in &log.traces {
        let first = match trace.frames.first() {
            Some(first) => first,
            None => continue,
        };

        let anchor_eol = loop {
            match lines.next() {
                Some((content, eol)) if content == first.raw_text => break eol,
                Some((content, eol)) => {
                    let () = text.push_str(content);
                    let () = text.push_str(eol);
                }
                None => {
                    warn!(
                        "first frame of trace {} not found; leaving remaining text untouched",
                        trace.trace_id
                    );
                    let () = failures.push(FailureRecord {
                        object_path: first.object_path().unwrap_or_default().to_string(),
                        offset: first.object.as_ref().map(|_| first.lookup_offset()),
                        build_id: first.build_id.clone(),
                        resolved_target: None,
                        kind: FailureKind::Merge,
                        reason: format!(
                            "first frame of trace {} not found in original text: {}",
                            trace.trace_id, first.raw_text
                        ),
                    });
                    break 'traces
                }
            }
        };

        let mut consumed = 1;
        let mut last_eol = anchor_eol;
        let mut interleaved = Vec::new();
        while consumed < trace.frames.len() {
            let (content, eol) = match lines.next() {
                Some(line) => line,
                None => break,
            };
            if Frame::parse_line(content, trace.trace_id).is_some() {
                consumed += 1;
                last_eol = eol;
            } else {
                let () = interleaved.push((content, eol));
            }
        }

        if consumed < trace.frames.len() {
            debug!(
                "trace {} ended after {consumed} of {} frames",
                trace.trace_id,
                trace.frames.len()
            );
        }

        let eol = if anchor_eol.is_empty() {
            "\n"
        } else {
            anchor_eol
        };
        let rendered = render(trace, table);
        let mut block = rendered
            .iter()
            .map(|line| (line.as_str(), eol))
            .chain(interleaved)
            .collect::<Vec<_>>();
        if let Some((_line, eol)) = block.last_mut() {
            *eol = last_eol;
        }

        for (line, eol) in block {
            let () = text.push_str(line);
            let () = text.push_str(eol);
        }
    }

    for (content, eol) in lines {
        let () = text.push_str(content);
        let () = text.push_str(eol);
    }

    Merged { text, failures }
}
