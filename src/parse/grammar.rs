//! The grammar of stack frame lines.
//!
//! A frame line looks like
//! ```text
//!   #3 0x1ffff9de0d58 (/usr/lib64/libfoo.so+0x1fdb8) (build-id:aa0d6e0011223344)
//! ```
//! It consists of a frame prefix (index marker and address) followed by
//! free form text. The object group and the build ID group are searched
//! for independently anywhere in that remainder.

use nom::bytes::complete::tag;
use nom::bytes::complete::tag_no_case;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::character::complete::digit1;
use nom::character::complete::hex_digit1;
use nom::character::complete::one_of;
use nom::character::complete::space0;
use nom::character::complete::space1;
use nom::combinator::map_res;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::sequence::delimited;
use nom::sequence::preceded;
use nom::sequence::tuple;
use nom::IResult;


/// The frame prefix of a line, borrowed from the line itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FramePrefix<'line> {
    /// The leading white space of the line.
    pub indent: &'line str,
    /// The frame index as written.
    pub index: usize,
    /// The address, including its `0x` prefix.
    pub address: &'line str,
    /// The parsed address value.
    pub address_value: u64,
    /// Everything following the address.
    pub rest: &'line str,
}

/// A `(<path>+0x<offset>)` object reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ObjectGroup<'line> {
    /// The absolute path of the object.
    pub path: &'line str,
    /// The offset into the object, including its `0x` prefix.
    pub offset: &'line str,
}


fn hex_number(input: &str) -> IResult<&str, (&str, u64)> {
    map_res(recognize(preceded(tag("0x"), hex_digit1)), |text: &str| {
        u64::from_str_radix(&text[2..], 16).map(|value| (text, value))
    })(input)
}

fn frame_prefix(input: &str) -> IResult<&str, FramePrefix<'_>> {
    let (rest, (indent, _hash, index, _space, (address, address_value))) = tuple((
        space0,
        char('#'),
        map_res(digit1, str::parse::<usize>),
        space1,
        hex_number,
    ))(input)?;

    let prefix = FramePrefix {
        indent,
        index,
        address,
        address_value,
        rest,
    };
    Ok((rest, prefix))
}

/// Parse the frame prefix of a line.
///
/// Returns `None` if the line is not a frame line.
pub(crate) fn parse_frame_prefix(line: &str) -> Option<FramePrefix<'_>> {
    let (_rest, prefix) = frame_prefix(line).ok()?;
    // The address has to end at a word boundary, just like `0x12zz`
    // does not denote an address.
    match prefix.rest.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => None,
        _ => Some(prefix),
    }
}


/// Match a parenthesized group not containing any nested parentheses,
/// returning its contents.
fn paren_group(input: &str) -> IResult<&str, &str> {
    delimited(
        char('('),
        take_while1(|c: char| c != '(' && c != ')'),
        char(')'),
    )(input)
}

fn object_group(input: &str) -> Option<ObjectGroup<'_>> {
    let (_rest, inner) = paren_group(input).ok()?;
    if !inner.starts_with('/') {
        return None
    }

    let (path, digits) = inner.rsplit_once("+0x")?;
    if path.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None
    }

    let offset = &inner[path.len() + 1..];
    Some(ObjectGroup { path, offset })
}

fn build_id_group(input: &str) -> IResult<&str, &str> {
    let (rest, (_open, _build, _sep, _id, _ws1, _colon, _ws2, build_id, _close)) = tuple((
        char('('),
        tag_no_case("build"),
        opt(one_of("- ")),
        tag_no_case("id"),
        space0,
        char(':'),
        space0,
        hex_digit1,
        char(')'),
    ))(input)?;
    Ok((rest, build_id))
}

/// Try `parser` at every opening parenthesis of `text`, from left to
/// right, returning the first match.
fn search<'text, T, F>(text: &'text str, mut parser: F) -> Option<T>
where
    F: FnMut(&'text str) -> Option<T>,
{
    text.match_indices('(')
        .find_map(|(idx, _paren)| parser(&text[idx..]))
}

/// Search `text` for the first `(<path>+0x<offset>)` group.
pub(crate) fn find_object_group(text: &str) -> Option<ObjectGroup<'_>> {
    search(text, object_group)
}

/// Search `text` for the first `(build-id: <hex>)` group.
pub(crate) fn find_build_id(text: &str) -> Option<&str> {
    search(text, |input| build_id_group(input).ok().map(|(_rest, id)| id))
}
