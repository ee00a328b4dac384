use std::fmt;

use thiserror::Error;

/// Failure modes of [`crate::Pattern::match_full`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    /// No path through the pattern consumes the whole input.
    #[error("input does not match the pattern")]
    Fail,
    /// A capturing group's index exceeds the caller's capture slice.
    #[error("more capture groups than capture slots")]
    Overflow,
}

/// Compilation failure of a grammar file on disk.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error("couldn't read grammar file: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the grammar compiler can reject, with the offending line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarError {
    /// 1-based source line, or 0 for errors found during symbol resolution
    /// (which has no single source position).
    pub line: usize,
    pub kind: GrammarErrorKind,
}

impl GrammarError {
    pub(crate) fn at(line: usize, kind: GrammarErrorKind) -> Self {
        Self { line, kind }
    }

    pub(crate) fn global(kind: GrammarErrorKind) -> Self {
        Self { line: 0, kind }
    }
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "bnf: {}", self.kind)
        } else {
            write!(f, "bnf line {}: {}", self.line, self.kind)
        }
    }
}

impl std::error::Error for GrammarError {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrammarErrorKind {
    #[error("bad single-character literal")]
    BadSingleCharLit,
    #[error("bad character class")]
    BadCharClass,
    #[error("string literal not terminated")]
    OpenString,
    #[error("string literal cannot be empty")]
    EmptyString,
    #[error("end of input inside an enclosed group")]
    UnclosedGrouping,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("circular symbol reference")]
    CircularDefinition,
    #[error("symbol \"{0}\" undefined")]
    UndefinedSymbol(String),
    #[error("duplicate symbol \"{0}\"")]
    DuplicateSymbol(String),
    #[error("rule does not have a name")]
    RuleWithoutName,
    #[error("rule name not followed by \"=\"")]
    RuleWithoutEq,
    #[error("quantifier digits not followed by '*'")]
    NumWithoutStar,
    #[error("no token following quantifier")]
    NoTokenAfterQuantifier,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(char),
    #[error("optional group [] cannot carry a quantifier")]
    OverspecifiedQuantifier,
    #[error("quantifier allows zero or inverted repetitions")]
    ZeroQuantifier,
    #[error("alternation and concatenation mixed at one grouping level")]
    AndOrMix,
}
