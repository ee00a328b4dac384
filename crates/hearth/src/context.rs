//! Process-wide immutable state, built once in `main` and shared by every
//! worker. Replaces what would otherwise be file-scope globals.

use std::path::PathBuf;

use hearth_pattern::{compile_str, GrammarError, Pattern};

use crate::{http::REQUEST_CAPTURES, mime::MimeMap};

/// The request-line grammar shipped with the server.
pub const HTTP_HEADER_BNF: &str = include_str!("../grammars/http_header.bnf");

pub struct AppContext {
    /// Document root URIs are resolved under.
    pub root: PathBuf,
    /// Compiled request-line pattern; read-only and shared across workers.
    pub request_line: Pattern,
    pub mime: MimeMap,
}

impl AppContext {
    pub fn new(root: PathBuf) -> Result<Self, GrammarError> {
        let request_line = compile_str(HTTP_HEADER_BNF)?;
        debug_assert_eq!(request_line.capture_count(), REQUEST_CAPTURES);
        Ok(Self { root, request_line, mime: MimeMap::new() })
    }
}
