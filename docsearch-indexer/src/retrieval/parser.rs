//! Text extraction from documents.
//!
//! [`DocumentParser`] is the seam for format-specific extraction. The default
//! [`PlainTextParser`] handles UTF-8 text, Markdown and source files.

use async_trait::async_trait;
use docsearch_retry::Retryable;
use std::path::{Path, PathBuf};

/// Version of the extraction logic. Bumping it marks every file indexed by an
/// older version as outdated.
pub const PARSER_VERSION: u32 = 1;

/// Page separator inside extracted text.
const FORM_FEED: char = '\x0c';

/// Text extracted from one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    /// Page texts, in document order. Single-page formats produce one entry.
    pub pages: Vec<String>,
    pub title: Option<String>,
    /// Short format tag stored with each chunk, e.g. `markdown`.
    pub source_type: String,
}

impl ExtractedText {
    /// True when no page contains anything but whitespace.
    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|page| page.trim().is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported file type: {}", path.display())]
    Unsupported { path: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl ParseError {
    /// The file disappeared between discovery and extraction.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ParseError::Unreadable { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl Retryable for ParseError {
    fn is_retryable(&self) -> bool {
        matches!(self, ParseError::Unreadable { .. }) && !self.is_not_found()
    }
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Whether `path` is a format this parser extracts.
    fn supports(&self, path: &Path) -> bool;

    async fn extract_text(&self, path: &Path) -> Result<ExtractedText, ParseError>;

    fn parser_version(&self) -> u32 {
        PARSER_VERSION
    }
}

/// UTF-8 text, Markdown and source code.
#[derive(Debug, Clone, Default)]
pub struct PlainTextParser;

impl PlainTextParser {
    pub fn new() -> Self {
        Self
    }

    fn source_type(path: &Path) -> &'static str {
        match extension(path).as_deref() {
            Some("md" | "markdown") => "markdown",
            Some("txt" | "text" | "rst" | "org") | None => "text",
            Some("json" | "toml" | "yaml" | "yml" | "csv") => "data",
            Some(_) => "code",
        }
    }

    fn title(path: &Path, first_page: &str, source_type: &str) -> Option<String> {
        if source_type == "markdown"
            && let Some(heading) = first_page
                .lines()
                .map(str::trim)
                .find_map(|line| line.strip_prefix("# "))
        {
            let heading = heading.trim();
            if !heading.is_empty() {
                return Some(heading.to_string());
            }
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

#[async_trait]
impl DocumentParser for PlainTextParser {
    fn supports(&self, path: &Path) -> bool {
        if let Some(filename) = path.file_name().and_then(|n| n.to_str())
            && filename.starts_with('.')
        {
            return false;
        }

        match extension(path).as_deref() {
            Some(
                "txt" | "text" | "md" | "markdown" | "rst" | "org" | "csv" | "log" | "rs" | "py"
                | "js" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "cpp" | "h" | "hpp" | "rb"
                | "sh" | "toml" | "yaml" | "yml" | "json" | "html" | "htm" | "xml",
            ) => true,
            Some(_) => false,
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| {
                    matches!(
                        name,
                        "README" | "CHANGELOG" | "LICENSE" | "NOTES" | "TODO" | "AUTHORS"
                    )
                }),
        }
    }

    async fn extract_text(&self, path: &Path) -> Result<ExtractedText, ParseError> {
        if !self.supports(path) {
            return Err(ParseError::Unsupported {
                path: path.to_path_buf(),
            });
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ParseError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;

        if bytes.contains(&0) {
            return Err(ParseError::Corrupt {
                path: path.to_path_buf(),
                reason: "contains NUL bytes".to_string(),
            });
        }
        let text = String::from_utf8(bytes).map_err(|e| ParseError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("invalid UTF-8: {e}"),
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let source_type = Self::source_type(path);
        let pages: Vec<String> = text.split(FORM_FEED).map(str::to_string).collect();
        let title = Self::title(path, pages.first().map(String::as_str).unwrap_or(""), source_type);

        Ok(ExtractedText {
            pages,
            title,
            source_type: source_type.to_string(),
        })
    }
}
