use colored::Colorize;

use crate::frontend::{SourceFile, intern::Symbol, lexer::Span};

/// An error found while turning source text into IR. Every variant carries
/// the span of the offending source text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("{message}")]
    Parse { message: String, span: Span },
    #[error("use of undeclared variable `{name}`")]
    UndeclaredVariable { name: Symbol, span: Span },
    #[error("variable `{name}` is already declared in this scope")]
    DuplicateDeclaration { name: Symbol, span: Span },
    #[error("call to unresolved function `{name}`")]
    UnresolvedFunction { name: Symbol, span: Span },
    #[error("function `{name}` is defined more than once")]
    DuplicateFunction { name: Symbol, span: Span },
    #[error("`{function}` expects {expected} argument(s) but {found} were given")]
    ArgumentCount {
        function: Symbol,
        expected: usize,
        found: usize,
        span: Span,
    },
    #[error("`{function}` returns void and cannot be used as a value")]
    VoidValue { function: Symbol, span: Span },
    #[error("`{variable}` has no member `{member}`")]
    InvalidMember {
        variable: Symbol,
        member: String,
        span: Span,
    },
    #[error("`{variable}` is neither an array nor a pointer")]
    NotIndexable { variable: Symbol, span: Span },
    #[error("`break` outside of a loop")]
    BreakOutsideLoop { span: Span },
    #[error("unknown type `{name}`")]
    UnknownType { name: String, span: Span },
    #[error("{message}")]
    UnbalancedBlock { message: &'static str, span: Span },
    #[error("invalid inline assembly: {message}")]
    InlineAssembly { message: String, span: Span },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::Parse { span, .. }
            | CompileError::UndeclaredVariable { span, .. }
            | CompileError::DuplicateDeclaration { span, .. }
            | CompileError::UnresolvedFunction { span, .. }
            | CompileError::DuplicateFunction { span, .. }
            | CompileError::ArgumentCount { span, .. }
            | CompileError::VoidValue { span, .. }
            | CompileError::InvalidMember { span, .. }
            | CompileError::NotIndexable { span, .. }
            | CompileError::BreakOutsideLoop { span }
            | CompileError::UnknownType { span, .. }
            | CompileError::UnbalancedBlock { span, .. }
            | CompileError::InlineAssembly { span, .. } => *span,
        }
    }

    pub fn parse(message: impl Into<String>, span: Span) -> Self {
        CompileError::Parse {
            message: message.into(),
            span,
        }
    }

    /// Formats the error with its location and the highlighted source line
    pub fn render(&self, source: &SourceFile) -> String {
        let span = self.span();

        format!(
            "{}: {} ({}:{}:{})\n{}",
            "error".red().bold(),
            self.to_string().bold(),
            source.origin,
            source.row_for_position(span.start),
            source.column_for_position(span.start),
            source.highlight_span(span)
        )
    }
}
