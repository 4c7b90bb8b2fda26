use std::{collections::HashMap, fmt, num::NonZeroU32, ops::Range, rc::Rc};

use codespan_reporting::files::{self, Files};

/// ID of a buffer registered with a [`SourceManager`].
///
/// A buffer is either a *file* buffer holding original source text, or an
/// *expansion* buffer synthesized while expanding a macro. Locations are only
/// comparable within the same buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(NonZeroU32);

impl BufferId {
    fn from_index(index: usize) -> Self {
        // Always adds 1 to the index, therefore it can never be zero.
        Self(NonZeroU32::new(index as u32 + 1).expect("buffer index overflow"))
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// A position within a buffer: `(buffer, byte offset)`.
///
/// Source locations are opaque handles; turning one into a file name, line,
/// and column is the job of the [`SourceManager`] that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    buffer: BufferId,
    offset: u32,
}

impl SourceLocation {
    /// Sentinel for tokens that were not spelled anywhere, such as the bodies
    /// of tool-injected macros. The source manager answers all queries about
    /// it with empty data.
    pub const NONE: SourceLocation = SourceLocation {
        buffer: BufferId(NonZeroU32::MAX),
        offset: 0,
    };

    pub fn new(buffer: BufferId, offset: u32) -> Self {
        Self { buffer, offset }
    }

    pub fn buffer(self) -> BufferId {
        self.buffer
    }

    pub fn offset(self) -> u32 {
        self.offset
    }

    /// Offsets this location forward within its buffer.
    pub fn advanced(self, by: u32) -> Self {
        Self {
            buffer: self.buffer,
            offset: self.offset + by,
        }
    }

    /// Distance to `earlier`, which must come from the same buffer.
    pub fn delta(self, earlier: SourceLocation) -> u32 {
        debug_assert_eq!(self.buffer, earlier.buffer);
        self.offset - earlier.offset
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Debug for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}+{}", self.buffer, self.offset)
    }
}

/// A half-open range `[start, end)` of locations within a single buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SourceRange {
    pub start: SourceLocation,
    pub end: SourceLocation,
}

impl SourceRange {
    pub fn new(start: SourceLocation, end: SourceLocation) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.delta(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

struct FileBuffer {
    name: String,
    source: Rc<str>,
    line_starts: Vec<usize>,
    /// `line` directives seen so far, ordered by the raw line they follow.
    line_directives: Vec<LineDirective>,
}

struct LineDirective {
    /// 1-based raw line of the directive itself; the remapping applies to
    /// every line after it.
    raw_line: usize,
    /// The line number the next raw line should report as.
    line_of_directive: usize,
    name: Option<String>,
}

struct ExpansionBuffer {
    /// Start of the spelling run this buffer maps back to.
    spelling: SourceLocation,
    /// Where the expansion was used; for macro bodies this covers the usage
    /// token (through the closing parenthesis when arguments are present).
    usage_range: SourceRange,
    is_macro_arg: bool,
    macro_name: Option<String>,
}

enum Buffer {
    File(FileBuffer),
    Expansion(ExpansionBuffer),
}

/// Issues buffer IDs and location handles, and answers provenance queries
/// about them.
///
/// File buffers are registered up front (`add_file`); expansion buffers are
/// minted by the preprocessor as it expands macros. Every location an
/// expanded token carries can be traced back to file text by iterating
/// [`SourceManager::spelling_loc`] and [`SourceManager::expansion_range`].
#[derive(Default)]
pub struct SourceManager {
    buffers: Vec<Buffer>,
    names: HashMap<String, BufferId>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file buffer. Later registrations under the same name
    /// shadow earlier ones for `include` lookup.
    pub fn add_file(&mut self, name: impl Into<String>, source: impl Into<Rc<str>>) -> BufferId {
        let name = name.into();
        let source = source.into();
        let id = BufferId::from_index(self.buffers.len());
        self.buffers.push(Buffer::File(FileBuffer {
            line_starts: files::line_starts(&source).collect(),
            name: name.clone(),
            source,
            line_directives: vec![],
        }));
        self.names.insert(name, id);
        id
    }

    /// Looks a file buffer up by the name it was registered under.
    pub fn buffer_for_name(&self, name: &str) -> Option<BufferId> {
        self.names.get(name).copied()
    }

    pub fn source(&self, buffer: BufferId) -> &str {
        match self.buffer(buffer) {
            Some(Buffer::File(file)) => &file.source,
            _ => "",
        }
    }

    pub fn source_rc(&self, buffer: BufferId) -> Rc<str> {
        match self.buffer(buffer) {
            Some(Buffer::File(file)) => Rc::clone(&file.source),
            _ => Rc::from(""),
        }
    }

    /// Mints an expansion buffer for a macro argument or for the
    /// continuation of a spelling run that crossed a buffer boundary.
    /// The returned location is the base of the new buffer; adding a token's
    /// distance from the first spelling yields that token's expansion
    /// location.
    pub fn create_expansion_loc(
        &mut self,
        spelling: SourceLocation,
        usage_range: SourceRange,
        is_macro_arg: bool,
    ) -> SourceLocation {
        self.push_expansion(ExpansionBuffer {
            spelling,
            usage_range,
            is_macro_arg,
            macro_name: None,
        })
    }

    /// Mints an expansion buffer for the body of the named macro.
    pub fn create_macro_expansion_loc(
        &mut self,
        spelling: SourceLocation,
        usage_range: SourceRange,
        macro_name: impl Into<String>,
    ) -> SourceLocation {
        self.push_expansion(ExpansionBuffer {
            spelling,
            usage_range,
            is_macro_arg: false,
            macro_name: Some(macro_name.into()),
        })
    }

    fn push_expansion(&mut self, info: ExpansionBuffer) -> SourceLocation {
        let id = BufferId::from_index(self.buffers.len());
        self.buffers.push(Buffer::Expansion(info));
        SourceLocation::new(id, 0)
    }

    fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.index())
    }

    fn expansion(&self, loc: SourceLocation) -> Option<&ExpansionBuffer> {
        match self.buffer(loc.buffer())? {
            Buffer::Expansion(info) => Some(info),
            Buffer::File(_) => None,
        }
    }

    pub fn is_macro_loc(&self, loc: SourceLocation) -> bool {
        self.expansion(loc).is_some()
    }

    pub fn is_macro_arg_loc(&self, loc: SourceLocation) -> bool {
        self.expansion(loc).is_some_and(|info| info.is_macro_arg)
    }

    /// One step back through the provenance chain: the location this
    /// expansion location was spelled at. File locations map to themselves.
    pub fn spelling_loc(&self, loc: SourceLocation) -> SourceLocation {
        match self.expansion(loc) {
            Some(info) => info.spelling.advanced(loc.offset()),
            None => loc,
        }
    }

    /// The usage range of the expansion buffer `loc` belongs to.
    pub fn expansion_range(&self, loc: SourceLocation) -> Option<SourceRange> {
        self.expansion(loc).map(|info| info.usage_range)
    }

    pub fn macro_name(&self, loc: SourceLocation) -> Option<&str> {
        self.expansion(loc)?.macro_name.as_deref()
    }

    /// Follows spelling links until a file location is reached.
    pub fn fully_original_loc(&self, mut loc: SourceLocation) -> SourceLocation {
        while self.is_macro_loc(loc) {
            loc = self.spelling_loc(loc);
        }
        loc
    }

    /// Follows usage links until a file location is reached; this is where a
    /// fully expanded token appears to the user.
    pub fn fully_expanded_loc(&self, mut loc: SourceLocation) -> SourceLocation {
        while let Some(range) = self.expansion_range(loc) {
            loc = range.start;
        }
        loc
    }

    /// Records a `line` directive at `loc`; attribution of all following
    /// lines in the same file buffer is remapped.
    pub fn add_line_directive(
        &mut self,
        loc: SourceLocation,
        line_of_directive: usize,
        name: Option<String>,
    ) {
        let raw_line = self.raw_line_number(loc);
        if let Some(Buffer::File(file)) = self.buffers.get_mut(loc.buffer().index()) {
            file.line_directives.push(LineDirective {
                raw_line,
                line_of_directive,
                name,
            });
        }
    }

    /// 1-based line number of a file location, ignoring `line` directives.
    fn raw_line_number(&self, loc: SourceLocation) -> usize {
        match self.buffer(loc.buffer()) {
            Some(Buffer::File(file)) => {
                file.line_starts
                    .partition_point(|&start| start <= loc.offset() as usize)
            }
            _ => 0,
        }
    }

    fn directive_for_line(&self, loc: SourceLocation, raw_line: usize) -> Option<&LineDirective> {
        match self.buffer(loc.buffer())? {
            Buffer::File(file) => file
                .line_directives
                .iter()
                .rev()
                .find(|directive| directive.raw_line < raw_line),
            _ => None,
        }
    }

    /// File name a location reports as, honoring `line` directives. Macro
    /// locations are resolved to their original spelling first.
    pub fn file_name(&self, loc: SourceLocation) -> &str {
        let loc = self.fully_original_loc(loc);
        let raw_line = self.raw_line_number(loc);
        if let Some(directive) = self.directive_for_line(loc, raw_line) {
            if let Some(name) = &directive.name {
                return name;
            }
        }
        match self.buffer(loc.buffer()) {
            Some(Buffer::File(file)) => &file.name,
            _ => "",
        }
    }

    /// 1-based line number a location reports as, honoring `line` directives.
    pub fn line_number(&self, loc: SourceLocation) -> usize {
        let loc = self.fully_original_loc(loc);
        let raw_line = self.raw_line_number(loc);
        match self.directive_for_line(loc, raw_line) {
            Some(directive) => directive.line_of_directive + raw_line - directive.raw_line - 1,
            None => raw_line,
        }
    }

    /// 1-based column number of a location.
    pub fn column_number(&self, loc: SourceLocation) -> usize {
        let loc = self.fully_original_loc(loc);
        match self.buffer(loc.buffer()) {
            Some(Buffer::File(file)) => {
                let line = file
                    .line_starts
                    .partition_point(|&start| start <= loc.offset() as usize);
                let line_start = file.line_starts.get(line - 1).copied().unwrap_or(0);
                loc.offset() as usize - line_start + 1
            }
            _ => 0,
        }
    }
}

impl<'f> Files<'f> for SourceManager {
    type FileId = BufferId;
    type Name = &'f str;
    type Source = &'f str;

    fn name(&'f self, id: Self::FileId) -> Result<Self::Name, files::Error> {
        match self.buffer(id) {
            Some(Buffer::File(file)) => Ok(&file.name),
            _ => Err(files::Error::FileMissing),
        }
    }

    fn source(&'f self, id: Self::FileId) -> Result<Self::Source, files::Error> {
        match self.buffer(id) {
            Some(Buffer::File(file)) => Ok(&file.source),
            _ => Err(files::Error::FileMissing),
        }
    }

    fn line_index(&'f self, id: Self::FileId, byte_index: usize) -> Result<usize, files::Error> {
        match self.buffer(id) {
            Some(Buffer::File(file)) => Ok(file
                .line_starts
                .binary_search(&byte_index)
                .unwrap_or_else(|next_line| next_line - 1)),
            _ => Err(files::Error::FileMissing),
        }
    }

    fn line_range(&'f self, id: Self::FileId, line_index: usize) -> Result<Range<usize>, files::Error> {
        match self.buffer(id) {
            Some(Buffer::File(file)) => {
                let start = file.line_starts.get(line_index).copied().ok_or(
                    files::Error::LineTooLarge {
                        given: line_index,
                        max: file.line_starts.len() - 1,
                    },
                )?;
                let end = file
                    .line_starts
                    .get(line_index + 1)
                    .copied()
                    .unwrap_or(file.source.len());
                Ok(start..end)
            }
            _ => Err(files::Error::FileMissing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_locations_chain_back_to_files() {
        let mut sm = SourceManager::new();
        let file = sm.add_file("test.sv", "`define FOO 1\n`FOO\n");

        let usage = SourceRange::new(
            SourceLocation::new(file, 14),
            SourceLocation::new(file, 18),
        );
        let body = SourceLocation::new(file, 12);
        let base = sm.create_macro_expansion_loc(body, usage, "FOO");

        assert!(sm.is_macro_loc(base));
        assert!(!sm.is_macro_arg_loc(base));
        assert_eq!(sm.macro_name(base), Some("FOO"));
        assert_eq!(sm.spelling_loc(base.advanced(1)), body.advanced(1));
        assert_eq!(sm.expansion_range(base), Some(usage));
        assert_eq!(sm.fully_original_loc(base), body);
        assert_eq!(sm.fully_expanded_loc(base), usage.start);
    }

    #[test]
    fn line_directives_remap_attribution() {
        let mut sm = SourceManager::new();
        let file = sm.add_file("source.sv", "`line 100 \"foo.svh\" 0\nident\n");

        assert_eq!(sm.line_number(SourceLocation::new(file, 22)), 2);
        sm.add_line_directive(SourceLocation::new(file, 0), 100, Some("foo.svh".into()));

        let ident = SourceLocation::new(file, 22);
        assert_eq!(sm.file_name(ident), "foo.svh");
        assert_eq!(sm.line_number(ident), 100);
        assert_eq!(sm.column_number(ident), 1);

        // The directive's own line is unaffected.
        let directive = SourceLocation::new(file, 0);
        assert_eq!(sm.file_name(directive), "source.sv");
        assert_eq!(sm.line_number(directive), 1);
    }
}
