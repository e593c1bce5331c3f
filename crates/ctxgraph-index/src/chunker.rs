//! Content parsing into retrievable chunks.
//!
//! Source files with a tree-sitter grammar are chunked along semantic
//! boundaries (functions, methods, classes, structs, traits). Markdown is
//! split at headings. Everything else, plus any stretch of a source file not
//! covered by a structural chunk, goes through a sliding window that prefers
//! paragraph, line and sentence breaks.
//!
//! Parsing yields a [`ChunkStream`]: a lazy iterator that can be cloned to
//! restart it. The same input always produces the same chunks.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tree_sitter::{Language, Node, Parser};

use crate::error::{IndexError, Result};
use crate::model::Span;

/// Default sliding window size, in characters.
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Default sliding window overlap, in characters.
pub const DEFAULT_WINDOW_OVERLAP: usize = 200;

/// Kind of chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Impl,
    Const,
    Class,
    Interface,
    /// A heading-delimited document section
    Section,
    /// A fixed-size window with no structural boundary
    Window,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Impl => "impl",
            Self::Const => "const",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Section => "section",
            Self::Window => "window",
        }
    }

    /// Callable symbols, the targets of `calls` edges.
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Function | Self::Method)
    }

    /// Named types, the targets of `references` edges.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Self::Struct | Self::Enum | Self::Trait | Self::Class | Self::Interface
        )
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub span: Span,
    pub kind: ChunkKind,
    /// Symbol name, heading, or first line for windows
    pub title: String,
    pub text: String,
    /// Enclosing scope, e.g. "impl Foo" or "class Bar"
    pub scope: Option<String>,
}

/// Sliding window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_WINDOW_SIZE,
            overlap: DEFAULT_WINDOW_OVERLAP,
        }
    }
}

impl WindowConfig {
    pub fn new(size: usize, overlap: usize) -> Self {
        Self { size, overlap }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(IndexError::InvalidConfig("window size must be positive".into()));
        }
        if self.overlap >= self.size {
            return Err(IndexError::InvalidConfig(format!(
                "window overlap {} must be smaller than window size {}",
                self.overlap, self.size
            )));
        }
        Ok(())
    }
}

/// Content parser producing ordered chunk streams.
#[derive(Debug, Clone)]
pub struct ContentParser {
    window: WindowConfig,
}

impl Default for ContentParser {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
        }
    }
}

impl ContentParser {
    pub fn new(window: WindowConfig) -> Result<Self> {
        window.validate()?;
        Ok(Self { window })
    }

    pub fn window(&self) -> WindowConfig {
        self.window
    }

    /// Detect language from file extension.
    pub fn detect_language(path: &str) -> Option<&'static str> {
        let ext = path.rsplit_once('.')?.1;
        match ext.to_ascii_lowercase().as_str() {
            "rs" => Some("rust"),
            "py" => Some("python"),
            "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
            "ts" | "mts" | "cts" => Some("typescript"),
            "tsx" => Some("tsx"),
            "go" => Some("go"),
            "md" | "markdown" | "mdx" => Some("markdown"),
            "txt" | "rst" | "adoc" => Some("text"),
            _ => None,
        }
    }

    /// Languages with a tree-sitter grammar.
    pub fn is_code_language(language: &str) -> bool {
        grammar(language).is_some()
    }

    /// Parse content into an ordered, restartable chunk stream.
    ///
    /// # Errors
    /// `ParseFailure` for binary content or when the grammar yields no tree.
    pub fn parse<'a>(
        &self,
        path: &str,
        content: &'a str,
        language: Option<&str>,
    ) -> Result<ChunkStream<'a>> {
        if content.contains('\0') {
            return Err(IndexError::ParseFailure {
                path: path.to_string(),
                reason: "binary content".into(),
            });
        }

        let segments = match language {
            Some("markdown") => markdown_segments(content, self.window.size),
            Some(lang) => match grammar(lang) {
                Some(grammar) => structural_segments(path, content, lang, grammar)?,
                None => whole_window(content),
            },
            None => whole_window(content),
        };

        Ok(ChunkStream {
            content,
            segments: segments.into_iter(),
            current: None,
            window: self.window,
        })
    }

    /// Text sent to the embedding provider: the chunk with file and scope context.
    pub fn embedding_text(descriptor: &ChunkDescriptor, path: &str) -> String {
        let mut enriched = String::new();
        enriched.push_str(&format!("# File: {}\n", path));
        if let Some(scope) = &descriptor.scope {
            enriched.push_str(&format!("# Scope: {}\n", scope));
        }
        enriched.push('\n');
        enriched.push_str(&descriptor.text);
        enriched
    }
}

fn grammar(language: &str) -> Option<Language> {
    match language {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Chunk(ChunkDescriptor),
    Window {
        start: usize,
        end: usize,
        kind: ChunkKind,
        title: Option<String>,
    },
}

/// Lazy, finite chunk sequence. Clone it to restart from the same point.
#[derive(Debug, Clone)]
pub struct ChunkStream<'a> {
    content: &'a str,
    segments: std::vec::IntoIter<Segment>,
    current: Option<WindowIter<'a>>,
    window: WindowConfig,
}

impl<'a> Iterator for ChunkStream<'a> {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<ChunkDescriptor> {
        loop {
            if let Some(windows) = self.current.as_mut() {
                if let Some(chunk) = windows.next() {
                    return Some(chunk);
                }
                self.current = None;
            }

            match self.segments.next()? {
                Segment::Chunk(chunk) => return Some(chunk),
                Segment::Window {
                    start,
                    end,
                    kind,
                    title,
                } => {
                    self.current = Some(WindowIter {
                        content: self.content,
                        pos: start,
                        end,
                        line: line_at(self.content, start),
                        size: self.window.size,
                        overlap: self.window.overlap,
                        kind,
                        title,
                        part: 0,
                    });
                }
            }
        }
    }
}

fn whole_window(content: &str) -> Vec<Segment> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    vec![Segment::Window {
        start: 0,
        end: content.len(),
        kind: ChunkKind::Window,
        title: None,
    }]
}

fn structural_segments(
    path: &str,
    content: &str,
    language: &str,
    grammar: Language,
) -> Result<Vec<Segment>> {
    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .map_err(|e| IndexError::ParseFailure {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

    let tree = parser
        .parse(content, None)
        .ok_or_else(|| IndexError::ParseFailure {
            path: path.to_string(),
            reason: format!("{} parser produced no tree", language),
        })?;

    let root = tree.root_node();
    if root.has_error() {
        debug!("Syntax errors in {}, falling back to window chunking", path);
        return Ok(whole_window(content));
    }

    let mut chunks = Vec::new();
    extract_chunks_recursive(root, content, &mut chunks, None);
    chunks.sort_by(|a, b| {
        a.span
            .byte_start
            .cmp(&b.span.byte_start)
            .then(b.span.byte_end.cmp(&a.span.byte_end))
    });

    // Stretches no structural chunk covers (imports, constants, statements)
    let mut segments = Vec::new();
    let mut covered_to = 0;
    let mut gaps = Vec::new();
    for chunk in &chunks {
        if chunk.span.byte_start > covered_to {
            gaps.push((covered_to, chunk.span.byte_start));
        }
        covered_to = covered_to.max(chunk.span.byte_end);
    }
    if covered_to < content.len() {
        gaps.push((covered_to, content.len()));
    }

    let mut gaps = gaps
        .into_iter()
        .filter(|(s, e)| content[*s..*e].chars().any(char::is_alphanumeric))
        .peekable();

    for chunk in chunks {
        while let Some(&(start, end)) = gaps.peek() {
            if start >= chunk.span.byte_start {
                break;
            }
            segments.push(Segment::Window {
                start,
                end,
                kind: ChunkKind::Window,
                title: None,
            });
            gaps.next();
        }
        segments.push(Segment::Chunk(chunk));
    }
    for (start, end) in gaps {
        segments.push(Segment::Window {
            start,
            end,
            kind: ChunkKind::Window,
            title: None,
        });
    }

    Ok(segments)
}

fn extract_chunks_recursive(
    node: Node,
    source: &str,
    chunks: &mut Vec<ChunkDescriptor>,
    scope: Option<&str>,
) {
    match node_to_chunk(node, source, scope) {
        Some(chunk) => {
            // Methods of impl blocks and classes become chunks of their own
            let child_scope = match chunk.kind {
                ChunkKind::Impl => Some(format!("impl {}", chunk.title)),
                ChunkKind::Class => Some(format!("class {}", chunk.title)),
                ChunkKind::Trait => Some(format!("trait {}", chunk.title)),
                _ => None,
            };
            if let Some(child_scope) = child_scope {
                for child in node.children(&mut node.walk()) {
                    extract_chunks_recursive(child, source, chunks, Some(&child_scope));
                }
            }
            chunks.push(chunk);
        }
        None => {
            for child in node.children(&mut node.walk()) {
                extract_chunks_recursive(child, source, chunks, scope);
            }
        }
    }
}

fn node_to_chunk(node: Node, source: &str, scope: Option<&str>) -> Option<ChunkDescriptor> {
    let (kind, title) = match node.kind() {
        // Rust
        "function_item" | "function_signature_item" => {
            (callable_kind(scope), child_text(node, "identifier", source)?)
        }
        "struct_item" => (ChunkKind::Struct, child_text(node, "type_identifier", source)?),
        "enum_item" => (ChunkKind::Enum, child_text(node, "type_identifier", source)?),
        "trait_item" => (ChunkKind::Trait, child_text(node, "type_identifier", source)?),
        "impl_item" => (ChunkKind::Impl, impl_name(node, source)?),
        "const_item" => (ChunkKind::Const, child_text(node, "identifier", source)?),

        // Python
        "function_definition" => (callable_kind(scope), child_text(node, "identifier", source)?),
        "class_definition" => (ChunkKind::Class, child_text(node, "identifier", source)?),

        // JavaScript / TypeScript
        "function_declaration" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| source[n.byte_range()].to_string())?;
            (ChunkKind::Function, name)
        }
        "class_declaration" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| source[n.byte_range()].to_string())?;
            (ChunkKind::Class, name)
        }
        "interface_declaration" => {
            (ChunkKind::Interface, child_text(node, "type_identifier", source)?)
        }
        "method_definition" => (
            ChunkKind::Method,
            child_text(node, "property_identifier", source)?,
        ),
        "lexical_declaration" => (ChunkKind::Function, arrow_function_name(node, source)?),

        // Go
        "method_declaration" => (ChunkKind::Method, child_text(node, "field_identifier", source)?),
        "type_declaration" => (ChunkKind::Struct, go_type_name(node, source)?),

        _ => return None,
    };

    let outer = outer_declaration(node);
    let (byte_start, line_start) = leading_comment_start(outer);
    let byte_end = outer.end_byte();
    let text = source[byte_start..byte_end].to_string();

    Some(ChunkDescriptor {
        span: Span {
            line_start: line_start + 1,
            line_end: outer.end_position().row + 1,
            byte_start,
            byte_end,
        },
        kind,
        title,
        text,
        scope: scope.map(String::from),
    })
}

fn callable_kind(scope: Option<&str>) -> ChunkKind {
    if scope.is_some() {
        ChunkKind::Method
    } else {
        ChunkKind::Function
    }
}

/// Include `export` and decorator wrappers in the chunk.
fn outer_declaration(node: Node) -> Node {
    let mut outer = node;
    while let Some(parent) = outer.parent() {
        if matches!(parent.kind(), "export_statement" | "decorated_definition") {
            outer = parent;
        } else {
            break;
        }
    }
    outer
}

/// Extend a chunk upward over adjacent doc comments and attributes.
fn leading_comment_start(node: Node) -> (usize, usize) {
    let mut first = node;
    while let Some(prev) = first.prev_sibling() {
        let attached = prev.kind().contains("comment") || prev.kind() == "attribute_item";
        if attached && prev.end_position().row + 1 >= first.start_position().row {
            first = prev;
        } else {
            break;
        }
    }
    (first.start_byte(), first.start_position().row)
}

fn impl_name(node: Node, source: &str) -> Option<String> {
    node.children(&mut node.walk())
        .find(|c| c.kind() == "type_identifier" || c.kind() == "generic_type")
        .map(|c| source[c.byte_range()].to_string())
}

fn go_type_name(node: Node, source: &str) -> Option<String> {
    node.children(&mut node.walk())
        .find(|c| c.kind() == "type_spec")
        .and_then(|spec| child_text(spec, "type_identifier", source))
}

/// `const login = async () => {}` and `const f = function () {}`
fn arrow_function_name(node: Node, source: &str) -> Option<String> {
    node.children(&mut node.walk())
        .filter(|c| c.kind() == "variable_declarator")
        .find_map(|decl| {
            let value = decl.child_by_field_name("value")?;
            if matches!(
                value.kind(),
                "arrow_function" | "function_expression" | "function"
            ) {
                decl.child_by_field_name("name")
                    .map(|n| source[n.byte_range()].to_string())
            } else {
                None
            }
        })
}

fn child_text(node: Node, kind: &str, source: &str) -> Option<String> {
    node.children(&mut node.walk())
        .find(|c| c.kind() == kind)
        .map(|c| source[c.byte_range()].to_string())
}

fn markdown_segments(content: &str, max_section_chars: usize) -> Vec<Segment> {
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some(title) = heading_title(trimmed) {
                headings.push((offset, title));
            }
        }
        offset += line.len();
    }

    let mut bounds: Vec<(usize, usize, String)> = Vec::new();
    let first = headings.first().map(|(o, _)| *o).unwrap_or(content.len());
    if first > 0 {
        bounds.push((0, first, "(preamble)".to_string()));
    }
    for (i, (start, title)) in headings.iter().enumerate() {
        let end = headings
            .get(i + 1)
            .map(|(o, _)| *o)
            .unwrap_or(content.len());
        bounds.push((*start, end, title.clone()));
    }

    bounds
        .into_iter()
        .filter(|(s, e, _)| !content[*s..*e].trim().is_empty())
        .map(|(start, end, title)| {
            let text = &content[start..end];
            if text.chars().count() > max_section_chars {
                Segment::Window {
                    start,
                    end,
                    kind: ChunkKind::Section,
                    title: Some(title),
                }
            } else {
                let line_start = line_at(content, start);
                Segment::Chunk(ChunkDescriptor {
                    span: Span {
                        line_start,
                        line_end: line_start + text.trim_end_matches('\n').matches('\n').count(),
                        byte_start: start,
                        byte_end: end,
                    },
                    kind: ChunkKind::Section,
                    title,
                    text: text.to_string(),
                    scope: None,
                })
            }
        })
        .collect()
}

fn heading_title(line: &str) -> Option<String> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') && rest != "\n" {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    Some(if title.is_empty() {
        "(untitled)".to_string()
    } else {
        title.to_string()
    })
}

#[derive(Debug, Clone)]
struct WindowIter<'a> {
    content: &'a str,
    pos: usize,
    end: usize,
    line: usize,
    size: usize,
    overlap: usize,
    kind: ChunkKind,
    title: Option<String>,
    part: usize,
}

impl<'a> Iterator for WindowIter<'a> {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<ChunkDescriptor> {
        while self.pos < self.end {
            let start = self.pos;
            let target = advance_chars(self.content, start, self.end, self.size);
            let stop = find_break_point(self.content.as_bytes(), start, target, self.end);
            let text = &self.content[start..stop];
            let line_start = self.line;
            let line_end = line_start + text.trim_end_matches('\n').matches('\n').count();

            if stop >= self.end {
                self.pos = self.end;
            } else {
                let back = retreat_chars(self.content, stop, self.overlap);
                let next = if back > start { back } else { stop };
                self.line += self.content[start..next].matches('\n').count();
                self.pos = next;
            }

            if text.trim().is_empty() {
                continue;
            }

            self.part += 1;
            let title = match &self.title {
                Some(t) => format!("{} #{}", t, self.part),
                None => first_line_title(text),
            };

            return Some(ChunkDescriptor {
                span: Span {
                    line_start,
                    line_end,
                    byte_start: start,
                    byte_end: stop,
                },
                kind: self.kind,
                title,
                text: text.to_string(),
                scope: None,
            });
        }
        None
    }
}

/// Byte offset `n` characters after `from`, capped at `limit`.
fn advance_chars(content: &str, from: usize, limit: usize, n: usize) -> usize {
    content[from..limit]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(limit)
}

/// Byte offset `n` characters before `from`.
fn retreat_chars(content: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    content[..from]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Prefer a paragraph break, then a newline, then a sentence end near `target`.
fn find_break_point(bytes: &[u8], start: usize, target: usize, end: usize) -> usize {
    if target >= end {
        return end;
    }

    let search_start = target - (target - start) / 5;
    let search_end = (target + (target - start) / 10).min(end);

    for i in (search_start..search_end).rev() {
        if i + 1 < end && bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return i + 2;
        }
    }

    for i in (search_start..search_end).rev() {
        if bytes[i] == b'\n' {
            return i + 1;
        }
    }

    for i in (search_start..search_end).rev() {
        if matches!(bytes[i], b'.' | b'!' | b'?') && i + 1 < end && bytes[i + 1].is_ascii_whitespace()
        {
            return i + 1;
        }
    }

    target
}

fn line_at(content: &str, byte: usize) -> usize {
    content[..byte].matches('\n').count() + 1
}

fn first_line_title(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(path: &str, content: &str) -> Vec<ChunkDescriptor> {
        let parser = ContentParser::default();
        let language = ContentParser::detect_language(path);
        parser.parse(path, content, language).unwrap().collect()
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(ContentParser::detect_language("src/main.rs"), Some("rust"));
        assert_eq!(ContentParser::detect_language("app.py"), Some("python"));
        assert_eq!(ContentParser::detect_language("web/auth.ts"), Some("typescript"));
        assert_eq!(ContentParser::detect_language("web/App.tsx"), Some("tsx"));
        assert_eq!(ContentParser::detect_language("README.md"), Some("markdown"));
        assert_eq!(ContentParser::detect_language("Makefile"), None);
    }

    #[test]
    fn test_chunk_rust_source() {
        let source = r#"
use std::fmt;

/// A point.
pub struct Point {
    x: i32,
}

impl Point {
    pub fn new(x: i32) -> Self {
        Self { x }
    }
}

pub fn standalone() -> i32 {
    42
}
"#;
        let chunks = parse_all("lib.rs", source);
        let titles: Vec<(&str, ChunkKind)> =
            chunks.iter().map(|c| (c.title.as_str(), c.kind)).collect();

        assert!(titles.contains(&("Point", ChunkKind::Struct)));
        assert!(titles.contains(&("Point", ChunkKind::Impl)));
        assert!(titles.contains(&("new", ChunkKind::Method)));
        assert!(titles.contains(&("standalone", ChunkKind::Function)));

        let method = chunks.iter().find(|c| c.title == "new").unwrap();
        assert_eq!(method.scope.as_deref(), Some("impl Point"));

        // Doc comment is attached to the struct
        let point = chunks
            .iter()
            .find(|c| c.kind == ChunkKind::Struct)
            .unwrap();
        assert!(point.text.starts_with("/// A point."));

        // The use statement is kept in a window chunk
        assert!(chunks
            .iter()
            .any(|c| c.kind == ChunkKind::Window && c.text.contains("use std::fmt;")));
    }

    #[test]
    fn test_chunks_are_ordered_by_position() {
        let source = "fn b() {}\n\nfn a() {}\n";
        let chunks = parse_all("x.rs", source);
        let titles: Vec<&str> = chunks.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a"]);
    }

    #[test]
    fn test_chunk_line_numbers() {
        let source = "fn first() { }\n\nfn second() {\n    let x = 1;\n}\n";
        let chunks = parse_all("x.rs", source);
        let second = chunks.iter().find(|c| c.title == "second").unwrap();
        assert_eq!(second.span.line_start, 3);
        assert_eq!(second.span.line_end, 5);
        assert_eq!(&source[second.span.byte_start..second.span.byte_end], second.text);
    }

    #[test]
    fn test_chunk_typescript_functions() {
        let source = r#"import { db } from "./db";

export function login(user: string, password: string): boolean {
    return db.check(user, password);
}

export const logout = async (user: string) => {
    db.clear(user);
};

interface Session {
    user: string;
}
"#;
        let chunks = parse_all("auth.ts", source);
        let names: Vec<&str> = chunks
            .iter()
            .filter(|c| c.kind != ChunkKind::Window)
            .map(|c| c.title.as_str())
            .collect();
        assert_eq!(names, vec!["login", "logout", "Session"]);
    }

    #[test]
    fn test_chunk_python_class_methods() {
        let source = "class Auth:\n    def login(self):\n        pass\n\n    def logout(self):\n        pass\n";
        let chunks = parse_all("auth.py", source);
        let methods: Vec<&str> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Method)
            .map(|c| c.title.as_str())
            .collect();
        assert_eq!(methods, vec!["login", "logout"]);
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Class && c.title == "Auth"));
    }

    #[test]
    fn test_chunk_go_function() {
        let source = "package main\n\nfunc Handle() error {\n\treturn nil\n}\n";
        let chunks = parse_all("main.go", source);
        assert!(chunks
            .iter()
            .any(|c| c.kind == ChunkKind::Function && c.title == "Handle"));
    }

    #[test]
    fn test_syntax_error_falls_back_to_windows() {
        let source = "fn broken( {\n    let = ;\n";
        let chunks = parse_all("broken.rs", source);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Window));
    }

    #[test]
    fn test_binary_content_is_parse_failure() {
        let parser = ContentParser::default();
        let err = parser.parse("blob.rs", "fn a() {}\0", Some("rust")).unwrap_err();
        assert!(matches!(err, IndexError::ParseFailure { .. }));
    }

    #[test]
    fn test_markdown_sections() {
        let source = "Intro text.\n\n# Setup\n\nInstall it.\n\n```sh\n# not a heading\n```\n\n## Auth\n\nUse tokens.\n";
        let chunks = parse_all("README.md", source);
        let titles: Vec<&str> = chunks.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["(preamble)", "Setup", "Auth"]);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Section));
        assert!(chunks[1].text.contains("# not a heading"));
        assert_eq!(chunks[2].span.line_start, 11);
    }

    #[test]
    fn test_window_overlap_and_coverage() {
        let parser = ContentParser::new(WindowConfig::new(100, 20)).unwrap();
        let paragraph = "This sentence talks about tokens. ".repeat(20);
        let chunks: Vec<_> = parser.parse("notes.txt", &paragraph, Some("text")).unwrap().collect();

        assert!(chunks.len() > 1);
        assert_eq!(chunks.first().unwrap().span.byte_start, 0);
        assert_eq!(chunks.last().unwrap().span.byte_end, paragraph.len());
        for pair in chunks.windows(2) {
            // Consecutive windows overlap and always advance
            assert!(pair[1].span.byte_start < pair[0].span.byte_end);
            assert!(pair[1].span.byte_start > pair[0].span.byte_start);
        }
    }

    #[test]
    fn test_window_prefers_paragraph_break() {
        let parser = ContentParser::new(WindowConfig::new(50, 0)).unwrap();
        let text = format!("{}\n\n{}", "a".repeat(45), "b".repeat(40));
        let chunks: Vec<_> = parser.parse("n.txt", &text, None).unwrap().collect();
        assert_eq!(chunks[0].text, format!("{}\n\n", "a".repeat(45)));
        assert_eq!(chunks[1].span.line_start, 3);
    }

    #[test]
    fn test_window_multibyte_safe() {
        let parser = ContentParser::new(WindowConfig::new(10, 3)).unwrap();
        let text = "héllo wörld ünïcode ✓✓✓ text ".repeat(3);
        let chunks: Vec<_> = parser.parse("u.txt", &text, None).unwrap().collect();
        assert!(!chunks.is_empty());
        assert_eq!(chunks.last().unwrap().span.byte_end, text.len());
    }

    #[test]
    fn test_stream_is_deterministic_and_restartable() {
        let parser = ContentParser::new(WindowConfig::new(64, 16)).unwrap();
        let text = "line of prose that repeats\n".repeat(12);
        let stream = parser.parse("a.txt", &text, None).unwrap();

        let restarted = stream.clone();
        let first: Vec<_> = stream.collect();
        let second: Vec<_> = restarted.collect();
        let third: Vec<_> = parser.parse("a.txt", &text, None).unwrap().collect();
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_invalid_window_config() {
        assert!(ContentParser::new(WindowConfig::new(0, 0)).is_err());
        assert!(ContentParser::new(WindowConfig::new(100, 100)).is_err());
        assert!(ContentParser::new(WindowConfig::new(100, 99)).is_ok());
    }

    #[test]
    fn test_empty_content_yields_nothing() {
        assert!(parse_all("empty.txt", "").is_empty());
        assert!(parse_all("blank.md", "\n\n  \n").is_empty());
    }

    #[test]
    fn test_embedding_text_has_context() {
        let chunks = parse_all("src/geo.rs", "impl P {\n    fn bar(&self) { }\n}\n");
        let method = chunks.iter().find(|c| c.title == "bar").unwrap();
        let text = ContentParser::embedding_text(method, "src/geo.rs");
        assert!(text.starts_with("# File: src/geo.rs\n# Scope: impl P\n"));
    }
}
