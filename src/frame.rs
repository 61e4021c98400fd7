use std::{fmt, path::PathBuf};

use rustc_demangle::try_demangle;
use serde::Serialize;

/// One position of an observed call stack.
///
/// `line` is the line currently executing in this frame: the allocation site
/// for the innermost frame, the call site for every caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Frame {
    /// Module path, type or class that owns the method, if known.
    pub owner: Option<String>,
    pub method: String,
    pub file: String,
    pub line: u32,
}

impl Frame {
    pub fn new(method: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Frame {
            owner: None,
            method: method.into(),
            file: file.into(),
            line,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// `owner#method`, or the bare method when the owner is unknown.
    pub fn qualified_name(&self) -> String {
        qualified_name(self.owner.as_deref(), &self.method)
    }

    pub fn key(&self) -> FrameKey {
        FrameKey {
            owner: self.owner.clone(),
            method: self.method.clone(),
            file: self.file.clone(),
        }
    }

    pub(crate) fn matches(&self, key: &FrameKey) -> bool {
        self.method == key.method && self.file == key.file && self.owner == key.owner
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.qualified_name(), self.file, self.line)
    }
}

pub(crate) fn qualified_name(owner: Option<&str>, method: &str) -> String {
    match owner {
        Some(owner) => format!("{owner}#{method}"),
        None => method.to_string(),
    }
}

/// Identity of a call-tree node: the method and the file that defines it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameKey {
    pub owner: Option<String>,
    pub method: String,
    pub file: String,
}

impl FrameKey {
    pub fn qualified_name(&self) -> String {
        qualified_name(self.owner.as_deref(), &self.method)
    }
}

/// Frames of one allocation, ordered from the outermost caller to the frame
/// in which the allocation happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackPath {
    frames: Vec<Frame>,
}

impl StackPath {
    /// Build a path from frames listed outermost first.
    pub fn new(frames: Vec<Frame>) -> Self {
        StackPath { frames }
    }

    /// Build a path from frames listed innermost first, the order stack
    /// walkers produce them in.
    pub fn from_innermost(mut frames: Vec<Frame>) -> Self {
        frames.reverse();
        StackPath { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn innermost(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }
}

impl FromIterator<Frame> for StackPath {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        StackPath {
            frames: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StackPath {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// A symbol as resolved from a native instruction pointer.
#[derive(Debug, Clone, Default)]
pub struct NativeFrame {
    /// Filename where the function call was made
    pub filename: Option<PathBuf>,
    /// Line number where the function call was made
    pub lineno: Option<u32>,
    /// Raw (possibly mangled) symbol name
    pub fn_name: Option<String>,
}

impl TryFrom<NativeFrame> for Frame {
    type Error = &'static str;

    fn try_from(value: NativeFrame) -> Result<Self, Self::Error> {
        let filename = value.filename.ok_or("filename is None")?;
        let file = filename.to_str().ok_or("filename is not valid UTF-8")?;
        let fn_name = value.fn_name.ok_or("fn_name is None")?;
        let line = value.lineno.ok_or("lineno is None")?;

        let name = demangle_name(&fn_name);
        if name.is_empty() {
            return Err("fn_name is empty");
        }

        let frame = match split_path(&name) {
            (Some(owner), method) => Frame::new(method, file, line).with_owner(owner),
            (None, method) => Frame::new(method, file, line),
        };
        Ok(frame)
    }
}

pub(crate) fn demangle_name(name: &str) -> String {
    let demangled = try_demangle(name)
        .map(|demangled| demangled.to_string())
        .unwrap_or_else(|_| name.to_string());

    strip_rust_hash_suffix(&demangled).to_string()
}

fn strip_rust_hash_suffix(name: &str) -> &str {
    const HASH_PREFIX: &str = "::h";

    match name.rfind(HASH_PREFIX) {
        Some(index) => {
            let hash = &name[index + HASH_PREFIX.len()..];
            let is_hex = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
            if is_hex { &name[..index] } else { name }
        }
        None => name,
    }
}

/// Splits `a::b::c` into (`a::b`, `c`), ignoring separators nested inside
/// generic arguments or trait-impl brackets.
fn split_path(path: &str) -> (Option<&str>, &str) {
    let bytes = path.as_bytes();
    let mut depth = 0usize;
    let mut split = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    match split {
        Some(index) if index > 0 => (Some(&path[..index]), &path[index + 2..]),
        _ => (None, path),
    }
}
