//! Code chunking (§3 CodeChunk, §3.1 codebase indexing).
//!
//! A light structural chunker: most source files get split at top-level
//! function/class boundaries detected by a per-language keyword regex; anything
//! left over (headers, trailing code, markup files) is chunked by blank-line
//! blocks instead. This mirrors `incremental_indexer.py`'s extension table closely
//! enough to drive the same set of languages without pulling in a real parser.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Class,
    Module,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    /// `file:start:end`, 1-indexed inclusive line range.
    pub id: String,
    pub content: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub kind: ChunkKind,
    pub metadata: std::collections::HashMap<String, Value>,
}

impl CodeChunk {
    fn new(file_path: &str, start_line: u32, end_line: u32, language: &str, kind: ChunkKind, content: String) -> Self {
        Self {
            id: format!("{file_path}:{start_line}:{end_line}"),
            content,
            file_path: file_path.to_string(),
            start_line,
            end_line,
            language: language.to_string(),
            kind,
            metadata: std::collections::HashMap::new(),
        }
    }
}

/// Indexable extensions, mirroring `incremental_indexer.py`'s default table.
pub const INDEXABLE_EXTENSIONS: &[&str] =
    &["rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "cpp", "c", "rb", "php", "sh", "md"];

pub const IGNORE_SEGMENTS: &[&str] = &[
    "__pycache__",
    "node_modules",
    ".git",
    "venv",
    ".venv",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "target",
    ".tox",
];

pub fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| IGNORE_SEGMENTS.contains(&c.as_os_str().to_string_lossy().as_ref()))
}

pub fn is_indexable(path: &Path) -> bool {
    if is_ignored(path) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| INDEXABLE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn language_of(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "cpp" | "c" => "c++",
        "rb" => "ruby",
        "php" => "php",
        "sh" => "shell",
        "md" => "markdown",
        _ => "text",
    }
}

fn boundary_regex() -> &'static Regex {
    static CELL: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?m)^\s*(pub\s+)?(async\s+)?(fn|def|class|struct|enum|impl|func|function)\s").unwrap()
    })
}

/// Split `content` at top-level function/class/struct boundaries when the language
/// recognizes them; else split on blank-line-separated blocks. Falls back to one
/// whole-file `Module` chunk when no boundary is found at all.
pub fn chunk_file(file_path: &str, content: &str) -> Vec<CodeChunk> {
    let path = Path::new(file_path);
    let language = language_of(path);
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let boundary = boundary_regex();
    let mut starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| boundary.is_match(line))
        .map(|(i, _)| i)
        .collect();

    if starts.is_empty() {
        return chunk_by_blank_lines(file_path, language, &lines);
    }

    if starts[0] != 0 {
        starts.insert(0, 0);
    }

    let mut chunks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(lines.len());
        let body = lines[start..end].join("\n");
        if body.trim().is_empty() {
            continue;
        }
        let kind = if idx == 0 && start == 0 && !boundary.is_match(lines[start]) {
            ChunkKind::Module
        } else if lines[start].contains("class") || lines[start].contains("struct") || lines[start].contains("enum") {
            ChunkKind::Class
        } else {
            ChunkKind::Function
        };
        chunks.push(CodeChunk::new(file_path, (start + 1) as u32, end as u32, language, kind, body));
    }
    chunks
}

fn chunk_by_blank_lines(file_path: &str, language: &str, lines: &[&str]) -> Vec<CodeChunk> {
    let mut chunks = Vec::new();
    let mut block_start = 0usize;
    let mut block: Vec<&str> = Vec::new();

    for (i, &line) in lines.iter().enumerate() {
        if line.trim().is_empty() && !block.is_empty() {
            chunks.push(CodeChunk::new(
                file_path,
                (block_start + 1) as u32,
                i as u32,
                language,
                ChunkKind::Block,
                block.join("\n"),
            ));
            block.clear();
            block_start = i + 1;
        } else if line.trim().is_empty() {
            block_start = i + 1;
        } else {
            block.push(line);
        }
    }
    if !block.is_empty() {
        chunks.push(CodeChunk::new(
            file_path,
            (block_start + 1) as u32,
            lines.len() as u32,
            language,
            ChunkKind::Block,
            block.join("\n"),
        ));
    }
    if chunks.is_empty() {
        chunks.push(CodeChunk::new(file_path, 1, lines.len() as u32, language, ChunkKind::Module, lines.join("\n")));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_encodes_file_and_line_range() {
        let chunks = chunk_file("src/main.rs", "fn main() {\n    println!(\"hi\");\n}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "src/main.rs:1:3");
    }

    #[test]
    fn splits_on_multiple_function_boundaries() {
        let content = "fn a() {\n    1\n}\n\nfn b() {\n    2\n}\n";
        let chunks = chunk_file("lib.rs", content);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("fn a"));
        assert!(chunks[1].content.contains("fn b"));
    }

    #[test]
    fn falls_back_to_blank_line_blocks_with_no_boundaries() {
        let content = "first block line one\nfirst block line two\n\nsecond block\n";
        let chunks = chunk_file("notes.md", content);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0].kind, ChunkKind::Block));
    }

    #[test]
    fn ignores_vendored_directories() {
        assert!(is_ignored(Path::new("node_modules/left-pad/index.js")));
        assert!(!is_ignored(Path::new("src/retrieval/mod.rs")));
    }

    #[test]
    fn only_indexable_extensions_pass() {
        assert!(is_indexable(Path::new("src/lib.rs")));
        assert!(!is_indexable(Path::new("target/debug/binary")));
        assert!(!is_indexable(Path::new("image.png")));
    }
}
