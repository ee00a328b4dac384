//! Grammar-compiled pattern matching.
//!
//! An augmented-BNF grammar is compiled into a finite state machine of
//! tokens, literals and character classes, consolidated, and then matched
//! against byte buffers with a backtracking walk that records capture
//! offsets. Compiled patterns are immutable and safely shared across
//! threads; all per-match state is call-local.
//!
//! ```
//! use hearth_pattern::{compile_str, Span};
//!
//! let pattern = compile_str(
//!     "phone = {3*3 <0123456789>} \"-\" 3*3 <0123456789> \"-\" 4*4 <0123456789>",
//! )
//! .unwrap();
//! let mut caps = vec![None; pattern.capture_count()];
//! pattern.match_full(b"314-159-2653", &mut caps).unwrap();
//! assert_eq!(caps[0], Some(Span { start: 0, end: 3 }));
//! ```

mod class;
mod consolidate;
mod error;
mod fsm;
mod grammar;
mod matcher;

pub use class::CharClass;
pub use error::{CompileError, GrammarError, GrammarErrorKind, MatchError};
pub use grammar::{compile_file, compile_str};
pub use matcher::{Pattern, Span};
