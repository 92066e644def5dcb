use std::path::PathBuf;

use colored::Colorize;

use self::lexer::Span;

pub mod ast;
pub mod diagnostic;
pub mod intern;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

impl SourceFile {
    pub fn from_memory(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            origin: SourceFileOrigin::Memory,
        }
    }

    pub fn from_path(path: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            contents: std::fs::read_to_string(&path)?,
            origin: SourceFileOrigin::File(path),
        })
    }

    pub fn value_of_span(&self, span: Span) -> &str {
        &self.contents[span.start..span.end]
    }

    /// 1-based line number of a byte position
    pub fn row_for_position(&self, position: usize) -> usize {
        self.contents[..position.min(self.contents.len())]
            .bytes()
            .filter(|b| *b == b'\n')
            .count()
            + 1
    }

    /// 1-based column of a byte position
    pub fn column_for_position(&self, position: usize) -> usize {
        let position = position.min(self.contents.len());
        let line_start = self.contents[..position]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);

        position - line_start + 1
    }

    /// Renders the line containing the span with the span underlined
    pub fn highlight_span(&self, span: Span) -> String {
        let start = span.start.min(self.contents.len());
        let line_start = self.contents[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = self.contents[start..]
            .find('\n')
            .map(|i| start + i)
            .unwrap_or(self.contents.len());

        let row = self.row_for_position(start).to_string();
        let gutter = " ".repeat(row.len());
        let width = span.end.clamp(start + 1, line_end.max(start + 1)) - start;

        format!(
            "{gutter} {}\n{} {} {}\n{gutter} {} {}{}",
            "|".blue(),
            row.blue(),
            "|".blue(),
            &self.contents[line_start..line_end],
            "|".blue(),
            " ".repeat(start - line_start),
            "^".repeat(width).red().bold()
        )
    }
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}
