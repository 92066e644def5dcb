use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::frontend::{SourceFile, diagnostic::CompileError};

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    position: usize,
    chars: PeekNth<Chars<'source>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // func
    Identifier,       // main

    /* Literals */
    IntegerLiteral, // 1, 0x10
    CharLiteral,    // 'A'
    StringLiteral,  // "add r0, r1, r2"

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    Comma,        // ,
    Newline,      // \n

    /* Other */
    Colon, // :
    Dot,   // .
    Arrow, // ->

    /* Unary Ops */
    Bang,  // !
    Tilde, // ~

    /* Unary + Binary Ops */
    Minus, // -

    /* Binary Ops */
    Asterisk,             // *
    Plus,                 // +
    Divide,               // /
    Modulus,              // %
    BitwiseXor,           // ^
    BitwiseAnd,           // &
    BitwiseOr,            // |
    ShiftLeft,            // <<
    ShiftRight,           // >>
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Assignment */
    Equals,           // =
    PlusEquals,       // +=
    MinusEquals,      // -=
    MultiplyEquals,   // *=
    DivideEquals,     // /=
    ModulusEquals,    // %=
    BitwiseXorEquals, // ^=
    BitwiseAndEquals, // &=
    BitwiseOrEquals,  // |=
    ShiftLeftEquals,  // <<=
    ShiftRightEquals, // >>=
}

impl TokenKind {
    pub fn is_assignment_operator(&self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::PlusEquals
                | Self::MinusEquals
                | Self::MultiplyEquals
                | Self::DivideEquals
                | Self::ModulusEquals
                | Self::BitwiseXorEquals
                | Self::BitwiseAndEquals
                | Self::BitwiseOrEquals
                | Self::ShiftLeftEquals
                | Self::ShiftRightEquals
        )
    }

    /// Tokens after which an operator is binary rather than unary
    pub fn ends_operand(&self) -> bool {
        matches!(
            self,
            Self::Identifier
                | Self::IntegerLiteral
                | Self::CharLiteral
                | Self::CloseParen
                | Self::CloseBracket
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Func,
    Extern,
    End,
    If,
    Else,
    While,
    For,
    In,
    To,
    Break,
    Return,
    Asm,
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        (',', TokenKind::Comma),
        ('!', TokenKind::Bang),
        ('~', TokenKind::Tilde),
        (':', TokenKind::Colon),
        ('.', TokenKind::Dot),
        ('*', TokenKind::Asterisk),
        ('-', TokenKind::Minus),
        ('=', TokenKind::Equals),
        ('+', TokenKind::Plus),
        ('/', TokenKind::Divide),
        ('%', TokenKind::Modulus),
        ('^', TokenKind::BitwiseXor),
        ('&', TokenKind::BitwiseAnd),
        ('|', TokenKind::BitwiseOr),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

/// Two character operators, checked before the single char table
static DOUBLE_TOKENS: Lazy<BTreeMap<(char, char), TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        (('-', '>'), TokenKind::Arrow),
        (('=', '='), TokenKind::DoubleEquals),
        (('!', '='), TokenKind::NotEquals),
        (('<', '='), TokenKind::LessThanOrEqualTo),
        (('>', '='), TokenKind::GreaterThanOrEqualTo),
        (('+', '='), TokenKind::PlusEquals),
        (('-', '='), TokenKind::MinusEquals),
        (('*', '='), TokenKind::MultiplyEquals),
        (('/', '='), TokenKind::DivideEquals),
        (('%', '='), TokenKind::ModulusEquals),
        (('&', '='), TokenKind::BitwiseAndEquals),
        (('|', '='), TokenKind::BitwiseOrEquals),
        (('^', '='), TokenKind::BitwiseXorEquals),
        (('<', '<'), TokenKind::ShiftLeft),
        (('>', '>'), TokenKind::ShiftRight),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
        }
    }

    /// Lexes the whole file. Runs of blank lines collapse into one newline
    /// token and the stream always ends with a newline.
    pub fn tokenize(source: &'source SourceFile) -> Result<Vec<Token>, CompileError> {
        let mut lexer = Self::new(source);
        let mut tokens: Vec<Token> = Vec::new();

        while let Some(token) = lexer.next_token()? {
            if token.kind == TokenKind::Newline
                && tokens
                    .last()
                    .is_none_or(|last| last.kind == TokenKind::Newline)
            {
                continue;
            }

            tokens.push(token);
        }

        if tokens.last().is_some_and(|t| t.kind != TokenKind::Newline) {
            let end = source.contents.len();
            tokens.push(Token {
                kind: TokenKind::Newline,
                span: Span::new(end, end),
            });
        }

        Ok(tokens)
    }

    fn error(&self, start: usize, message: String) -> CompileError {
        CompileError::parse(message, Span::new(start, self.position.max(start + 1)))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn ignore_line(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                break;
            }

            self.bump();
        }
    }

    fn read_wrapped(&mut self, wrapper: char, kind: TokenKind) -> Result<Token, CompileError> {
        let start_position = self.position;

        // Consume first wrapper
        self.bump();

        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                return Err(self.error(
                    start_position,
                    format!("Reached end of line while reading wrapped literal: {kind:?}"),
                ));
            }

            self.bump();

            // Skip over whatever is escaped
            if c == '\\' {
                self.bump();
                continue;
            }

            if c == wrapper {
                return Ok(Token {
                    span: self.new_span(start_position),
                    kind,
                });
            }
        }

        Err(self.error(
            start_position,
            format!("Reached end of file while reading wrapped literal: {kind:?}"),
        ))
    }

    // Keyword or identifier
    fn read_word(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.bump();
        }

        let span = self.new_span(start_position);
        let value = self.source.value_of_span(span);

        let kind = match value.parse() {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(_) => TokenKind::Identifier,
        };

        Token { kind, span }
    }

    // Decimal or 0x-prefixed hex; the leading digit is what marks a literal
    fn read_number(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.bump();
        }

        Token {
            kind: TokenKind::IntegerLiteral,
            span: self.new_span(start_position),
        }
    }

    fn read_fixed(&mut self, kind: TokenKind, length: usize) -> Token {
        let start_position = self.position;

        for _ in 0..length {
            self.bump();
        }

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn new_span(&self, start: usize) -> Span {
        Span {
            start,
            end: self.position,
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, CompileError> {
        while let Some(c) = self.chars.peek().copied() {
            let next = self.chars.peek_nth(1).copied();
            let after = self.chars.peek_nth(2).copied();

            let token = match c {
                '\n' => self.read_fixed(TokenKind::Newline, 1),
                // Ignore whitespace
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                // Ignore comments
                '/' if next == Some('/') => {
                    self.ignore_line();
                    continue;
                }

                '"' => self.read_wrapped('"', TokenKind::StringLiteral)?,
                '\'' => self.read_wrapped('\'', TokenKind::CharLiteral)?,

                n if n.is_ascii_digit() => self.read_number(),

                // Identifiers and keywords
                a if a.is_ascii_alphabetic() || a == '_' => self.read_word(),

                // Shift assignment (<<=, >>=)
                '<' if next == Some('<') && after == Some('=') => {
                    self.read_fixed(TokenKind::ShiftLeftEquals, 3)
                }
                '>' if next == Some('>') && after == Some('=') => {
                    self.read_fixed(TokenKind::ShiftRightEquals, 3)
                }

                c if next.is_some_and(|n| DOUBLE_TOKENS.contains_key(&(c, n))) => {
                    let kind = DOUBLE_TOKENS[&(c, next.unwrap_or_default())];
                    self.read_fixed(kind, 2)
                }

                s if SINGLE_TOKENS.contains_key(&s) => self.read_fixed(SINGLE_TOKENS[&s], 1),

                c => {
                    let start = self.position;
                    self.bump();
                    return Err(self.error(start, format!("Unexpected character in stream: `{c}`")));
                }
            };

            return Ok(Some(token));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let source = SourceFile::from_memory(source);
        Lexer::tokenize(&source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_declaration_line() {
        assert_eq!(
            kinds("long[4] x = a << 2 // trailing comment"),
            vec![
                TokenKind::Identifier,
                TokenKind::OpenBracket,
                TokenKind::IntegerLiteral,
                TokenKind::CloseBracket,
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::Identifier,
                TokenKind::ShiftLeft,
                TokenKind::IntegerLiteral,
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn lexes_keywords_and_compound_operators() {
        assert_eq!(
            kinds("for i in 0 to n\n\n\ni <<= 1\nend"),
            vec![
                TokenKind::Keyword(Keyword::For),
                TokenKind::Identifier,
                TokenKind::Keyword(Keyword::In),
                TokenKind::IntegerLiteral,
                TokenKind::Keyword(Keyword::To),
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::Identifier,
                TokenKind::ShiftLeftEquals,
                TokenKind::IntegerLiteral,
                TokenKind::Newline,
                TokenKind::Keyword(Keyword::End),
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn reports_unterminated_string() {
        let source = SourceFile::from_memory("asm \"add r0, r1, r2\n");
        let error = Lexer::tokenize(&source).unwrap_err();

        assert_eq!(error.span().start, 4);
    }
}
