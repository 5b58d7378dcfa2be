//! Parsing of crash logs into stack traces.

pub(crate) mod grammar;

use std::collections::BTreeSet;
use std::fs::read_to_string;
use std::mem::take;
use std::path::Path;

use crate::util::normalize_hex;
use crate::ErrorExt as _;
use crate::Result;

use self::grammar::find_build_id;
use self::grammar::find_object_group;
use self::grammar::parse_frame_prefix;


/// A reference to a location inside an object file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// The absolute path of the object, as recorded in the log.
    pub path: String,
    /// The offset into the object, as recorded in the log (including
    /// the `0x` prefix).
    pub offset: String,
}


/// A single frame of a stack trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// The index of the trace this frame belongs to.
    pub trace_id: usize,
    /// The frame index, as written in the log.
    pub frame_index: usize,
    /// The address, as written in the log.
    pub address: String,
    /// The parsed address.
    pub address_value: u64,
    /// The object reference, if the line carried one.
    pub object: Option<ObjectRef>,
    /// The build ID annotation, if the line carried one.
    pub build_id: Option<String>,
    /// The original line, without its line terminator.
    pub raw_text: String,
}

impl Frame {
    /// Parse a single line into a `Frame`.
    ///
    /// Returns `None` if the line is not a frame line.
    pub fn parse_line(line: &str, trace_id: usize) -> Option<Self> {
        let prefix = parse_frame_prefix(line)?;
        let object = find_object_group(prefix.rest).map(|group| ObjectRef {
            path: group.path.to_string(),
            offset: group.offset.to_string(),
        });
        let build_id = find_build_id(prefix.rest).map(str::to_string);

        let frame = Self {
            trace_id,
            frame_index: prefix.index,
            address: prefix.address.to_string(),
            address_value: prefix.address_value,
            object,
            build_id,
            raw_text: line.to_string(),
        };
        Some(frame)
    }

    /// The leading white space of the original line.
    pub fn indent(&self) -> &str {
        let trimmed = self.raw_text.trim_start();
        &self.raw_text[..self.raw_text.len() - trimmed.len()]
    }

    /// The object path, if any.
    #[inline]
    pub fn object_path(&self) -> Option<&str> {
        self.object.as_ref().map(|object| object.path.as_str())
    }

    /// The normalized offset (or, lacking an object reference, the
    /// normalized address) used for lookups.
    pub fn lookup_offset(&self) -> String {
        let text = self
            .object
            .as_ref()
            .map(|object| object.offset.as_str())
            .unwrap_or(&self.address);
        normalize_hex(text).into_owned()
    }
}


/// A stack trace: a sequence of frames starting at `#0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackTrace {
    /// The index of this trace within its log.
    pub trace_id: usize,
    /// The frames, in log order.
    pub frames: Vec<Frame>,
    /// Non-frame lines preceding the trace.
    pub preamble: Vec<String>,
}


/// The result of parsing a crash log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedLog {
    /// The stack traces, in log order.
    pub traces: Vec<StackTrace>,
    /// Non-frame lines following the last frame.
    pub trailer: Vec<String>,
}

impl ParsedLog {
    /// Iterate over all frames of all traces.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.traces.iter().flat_map(|trace| trace.frames.iter())
    }
}


/// Parse crash log text into stack traces.
///
/// A new trace starts at every `#0` frame following already collected
/// frames. Non-frame lines are preserved: they become the preamble of
/// the trace that follows them or, after the last frame, the trailer.
/// Input not starting at `#0` is tolerated and still opens trace 0.
pub fn parse(text: &str) -> ParsedLog {
    let mut traces = Vec::new();
    let mut current = None::<StackTrace>;
    let mut pending = Vec::<String>::new();
    // The number of pending lines at the time the last frame was seen.
    let mut pending_at_last_frame = 0;

    for line in text.lines() {
        let trace_id = match &current {
            Some(trace) => trace.trace_id,
            None => traces.len(),
        };

        let mut frame = match Frame::parse_line(line, trace_id) {
            Some(frame) => frame,
            None => {
                let () = pending.push(line.to_string());
                continue
            }
        };

        if frame.frame_index == 0 {
            if let Some(trace) = current.take() {
                let () = traces.push(trace);
                frame.trace_id = traces.len();
            }
        }

        let trace = current.get_or_insert_with(|| StackTrace {
            trace_id: traces.len(),
            frames: Vec::new(),
            preamble: take(&mut pending),
        });
        let () = trace.frames.push(frame);
        pending_at_last_frame = pending.len();
    }

    if let Some(trace) = current.take() {
        let () = traces.push(trace);
    }

    let trailer = if traces.is_empty() {
        pending
    } else {
        pending.split_off(pending_at_last_frame.min(pending.len()))
    };

    ParsedLog { traces, trailer }
}

/// Read and parse the crash log at `path`.
pub fn parse_file(path: &Path) -> Result<ParsedLog> {
    let text = read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse(&text))
}

/// Collect the distinct `(object path, build ID)` pairs referenced by
/// the provided traces.
pub fn unique_objects<'trace, I>(traces: I) -> BTreeSet<(String, Option<String>)>
where
    I: IntoIterator<Item = &'trace StackTrace>,
{
    traces
        .into_iter()
        .flat_map(|trace| trace.frames.iter())
        .filter_map(|frame| {
            let object = frame.object.as_ref()?;
            Some((object.path.clone(), frame.build_id.clone()))
        })
        .collect()
}
