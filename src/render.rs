//! Rendering of symbolized stack traces.

use crate::cache::SymbolTable;
use crate::parse::Frame;
use crate::parse::ParsedLog;
use crate::parse::StackTrace;
use crate::SymbolInfo;


/// Rewrite the `#<n>` frame index of a line not referencing an object.
fn renumber(frame: &Frame, index: usize) -> String {
    let indent = frame.indent();
    let body = &frame.raw_text[indent.len()..];
    let rest = body
        .strip_prefix('#')
        .unwrap_or(body)
        .trim_start_matches(|c: char| c.is_ascii_digit());
    format!("{indent}#{index}{rest}")
}

/// Render the lines for a single frame, starting at frame index
/// `index`.
fn render_frame(frame: &Frame, table: &SymbolTable, index: usize, lines: &mut Vec<String>) {
    let object = match &frame.object {
        Some(object) => object,
        None => {
            let () = lines.push(renumber(frame, index));
            return
        }
    };

    let unknown;
    let info = match table.get_frame(frame) {
        Some(info) => info,
        None => {
            unknown = SymbolInfo::unknown();
            &unknown
        }
    };

    let indent = frame.indent();
    let address = &frame.address;
    let entries = info.entries();
    // A lone entry only gets the reference when nothing at all is known.
    let hint = if entries.len() == 1 {
        info.is_unknown()
    } else {
        entries
            .first()
            .is_some_and(|entry| entry.has_unknown_location())
    };
    for (i, entry) in entries.iter().enumerate() {
        let mut line = format!(
            "{indent}#{} {address} in {} at {}",
            index + i,
            entry.function,
            entry.location
        );
        if i == 0 && hint {
            line += &format!(" ({}+{})", object.path, object.offset);
            if let Some(build_id) = &frame.build_id {
                line += &format!(" (build-id:{build_id})");
            }
        }
        let () = lines.push(line);
    }
}


/// Render a stack trace using the results in `table`.
///
/// Frames referencing an object expand into one line per (inlined)
/// function, frames without an object reference keep their text. The
/// frame index restarts at zero and counts every emitted line.
pub fn render(trace: &StackTrace, table: &SymbolTable) -> Vec<String> {
    let mut lines = Vec::with_capacity(trace.frames.len());
    for frame in &trace.frames {
        let index = lines.len();
        let () = render_frame(frame, table, index, &mut lines);
    }
    lines
}

/// Render all stack traces of `log`, omitting everything else.
///
/// Traces are separated by an empty line.
pub fn render_all(log: &ParsedLog, table: &SymbolTable) -> String {
    let mut text = String::new();
    for (i, trace) in log.traces.iter().enumerate() {
        if i > 0 {
            let () = text.push('\n');
        }
        for line in render(trace, table) {
            let () = text.push_str(&line);
            let () = text.push('\n');
        }
    }
    text
}
