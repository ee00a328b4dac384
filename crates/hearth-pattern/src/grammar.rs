//! Augmented-BNF grammar compiler.
//!
//! A grammar is a sequence of rules `Name = expression`, the first rule
//! being the main one. `;` comments to end of line; expressions are
//! line-bound unless a `()`/`[]`/`{}` grouping spans lines. Tokens are
//! string literals (`"abc"`), single-character literals with escapes
//! (`'c'`, `'\n'`, `'\x1F'`), character classes (`<abc>`, with `\<`/`\>`
//! escaped), rule references, and groupings; `m*n` quantifies the following
//! token, `[x]` is `0*1 x`, `{x}` captures, `a b` concatenates and `a | b`
//! alternates with first-match precedence. Concatenation and alternation
//! cannot be mixed at one grouping level.
//!
//! Compilation lowers each rule to a token FSM, resolves references by
//! deep-copying the referenced rule into place, then consolidates the main
//! rule. Any error abandons the compilation; the arena and everything in it
//! is dropped wholesale.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::warn;

use crate::{
    class::CharClass,
    consolidate::consolidate,
    error::{CompileError, GrammarError, GrammarErrorKind},
    fsm::{Fsm, Node, NodeId, Token},
    matcher::Pattern,
};

/// Compiles a grammar held in memory.
pub fn compile_str(text: &str) -> Result<Pattern, GrammarError> {
    Parser::new(text).compile()
}

/// Compiles a grammar file from disk.
pub fn compile_file<P: AsRef<std::path::Path>>(path: P) -> Result<Pattern, CompileError> {
    let text = std::fs::read_to_string(path)?;
    Ok(compile_str(&text)?)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'@')
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Processing,
    Visited,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Grouping {
    And,
    Or,
}

struct Parser<'a> {
    fsm: Fsm,
    /// Rule name → rule FSM root, in definition order (first = main rule).
    rules: IndexMap<String, NodeId>,
    /// Capture groups seen so far; indices are handed out in parse order.
    n_captures: u32,
    lines: std::str::Split<'a, char>,
    /// Remainder of the current line.
    cur: &'a [u8],
    linen: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            fsm: Fsm::new(),
            rules: IndexMap::new(),
            n_captures: 0,
            lines: text.split('\n'),
            cur: &[],
            linen: 0,
        }
    }

    fn err(&self, kind: GrammarErrorKind) -> GrammarError {
        GrammarError::at(self.linen, kind)
    }

    fn compile(mut self) -> Result<Pattern, GrammarError> {
        while self.rule_parse()? {}

        let Some((_, &main)) = self.rules.get_index(0) else {
            return Err(self.err(GrammarErrorKind::UnexpectedEof));
        };
        self.resolve_symbols(main)?;
        consolidate(&mut self.fsm, main);
        Ok(Pattern { fsm: self.fsm, root: main, captures: self.n_captures })
    }

    // -------------------- scanning --------------------

    fn read_line(&mut self) -> bool {
        match self.lines.next() {
            Some(line) => {
                self.cur = line.as_bytes();
                self.linen += 1;
                true
            }
            None => {
                self.cur = &[];
                false
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.cur.first().copied()
    }

    fn bump(&mut self) {
        self.cur = &self.cur[1..];
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
    }

    /// Advances to the next non-whitespace character, pulling fresh lines as
    /// needed. Returns false at end of input.
    fn next_non_ws(&mut self) -> bool {
        self.skip_ws();
        while self.cur.is_empty() {
            if !self.read_line() {
                return false;
            }
            self.skip_ws();
        }
        true
    }

    fn take_digits(&mut self) -> Option<u32> {
        let end = self.cur.iter().position(|b| !b.is_ascii_digit()).unwrap_or(self.cur.len());
        if end == 0 {
            return None;
        }
        let mut val: u32 = 0;
        for &b in &self.cur[..end] {
            val = val.saturating_mul(10).saturating_add(u32::from(b - b'0'));
        }
        self.cur = &self.cur[end..];
        Some(val)
    }

    /// Decodes one possibly-escaped character at the cursor. Handles the
    /// C-style escapes and `\xHH`.
    fn char_val(&mut self) -> Result<u8, GrammarError> {
        let Some(c) = self.peek() else {
            return Err(self.err(GrammarErrorKind::BadSingleCharLit));
        };
        if c != b'\\' {
            self.bump();
            return Ok(c);
        }
        let Some(&e) = self.cur.get(1) else {
            return Err(self.err(GrammarErrorKind::BadSingleCharLit));
        };
        if e == b'x' {
            let (Some(&h1), Some(&h2)) = (self.cur.get(2), self.cur.get(3)) else {
                return Err(self.err(GrammarErrorKind::BadSingleCharLit));
            };
            if !h1.is_ascii_hexdigit() || !h2.is_ascii_hexdigit() {
                return Err(self.err(GrammarErrorKind::BadSingleCharLit));
            }
            let hex = |h: u8| -> u8 {
                match h {
                    b'0'..=b'9' => h - b'0',
                    b'a'..=b'f' => h - b'a' + 10,
                    _ => h - b'A' + 10,
                }
            };
            self.cur = &self.cur[4..];
            return Ok((hex(h1) << 4) | hex(h2));
        }
        let val = match e {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'?' => b'?',
            _ => return Err(self.err(GrammarErrorKind::BadSingleCharLit)),
        };
        self.cur = &self.cur[2..];
        Ok(val)
    }

    // -------------------- rule parsing --------------------

    /// Parses one `Name = expression` rule. Returns false at clean EOF.
    fn rule_parse(&mut self) -> Result<bool, GrammarError> {
        // skip blank lines and comment-only lines
        loop {
            if !self.read_line() {
                return Ok(false);
            }
            self.skip_ws();
            if self.peek() == Some(b';') {
                self.cur = &[];
            }
            if !self.cur.is_empty() {
                break;
            }
        }

        if self.peek() == Some(b'=') {
            return Err(self.err(GrammarErrorKind::RuleWithoutName));
        }
        let end = self.cur.iter().position(|&b| !is_unreserved(b)).unwrap_or(self.cur.len());
        if end == 0 {
            return Err(self.err(GrammarErrorKind::RuleWithoutName));
        }
        let name = std::str::from_utf8(&self.cur[..end])
            .expect("unreserved characters are ascii")
            .to_owned();
        self.cur = &self.cur[end..];

        self.skip_ws();
        if self.peek() != Some(b'=') {
            return Err(self.err(GrammarErrorKind::RuleWithoutEq));
        }
        self.bump();
        self.skip_ws();

        let root = self.token_group_parse(None)?;
        if self.rules.contains_key(&name) {
            return Err(self.err(GrammarErrorKind::DuplicateSymbol(name)));
        }
        self.rules.insert(name, root);
        Ok(true)
    }

    /// Parses tokens until `term` (or end of line when `term` is `None`,
    /// since only groupings may cross lines), linking them by concatenation
    /// or alternation. Returns the group's entry token.
    fn token_group_parse(&mut self, term: Option<u8>) -> Result<NodeId, GrammarError> {
        let mut grouping: Option<Grouping> = None;
        let mut ret: Option<NodeId> = None;
        let mut last: Option<NodeId> = None;

        loop {
            if !self.next_non_ws() {
                if term.is_some() {
                    return Err(self.err(GrammarErrorKind::UnexpectedEof));
                }
                return ret.ok_or_else(|| self.err(GrammarErrorKind::UnexpectedEof));
            }

            // quantifier: *, *n, m* or m*n
            let mut quant: Option<(u32, Option<u32>)> = None;
            if let Some(c) = self.peek() {
                if c == b'*' || c.is_ascii_digit() {
                    let min = if c == b'*' {
                        0
                    } else {
                        let m = self.take_digits().expect("digit peeked");
                        if self.peek() != Some(b'*') {
                            return Err(self.err(GrammarErrorKind::NumWithoutStar));
                        }
                        m
                    };
                    self.bump(); // the '*'
                    let max = self.take_digits();
                    if min == 0 && max == Some(0) {
                        return Err(self.err(GrammarErrorKind::ZeroQuantifier));
                    }
                    if max.is_some_and(|m| min > m) {
                        return Err(self.err(GrammarErrorKind::ZeroQuantifier));
                    }
                    self.skip_ws();
                    if self.cur.is_empty() {
                        return Err(self.err(GrammarErrorKind::NoTokenAfterQuantifier));
                    }
                    quant = Some((min, max));
                }
            }

            let (min, max) = quant.unwrap_or((1, Some(1)));

            let token = match self.peek().expect("cursor on a token") {
                b'{' => {
                    self.bump();
                    let inner = self.token_group_parse(Some(b'}'))?;
                    self.bump();
                    let idx = self.n_captures;
                    self.n_captures += 1;
                    let tok = self.fsm.new_token(inner, min, max, Some(idx));
                    // every path through the group leads back to its token
                    self.fsm.connect(inner, tok);
                    tok
                }
                b'[' => {
                    if quant.is_some() {
                        return Err(self.err(GrammarErrorKind::OverspecifiedQuantifier));
                    }
                    self.bump();
                    let inner = self.token_group_parse(Some(b']'))?;
                    self.bump();
                    let tok = self.fsm.new_token(inner, 0, Some(1), None);
                    self.fsm.connect(inner, tok);
                    tok
                }
                b'(' => {
                    self.bump();
                    let inner = self.token_group_parse(Some(b')'))?;
                    self.bump();
                    if min == 1 && max == Some(1) {
                        inner
                    } else {
                        let head = *self.fsm.token(inner);
                        if head.next.is_none() && head.alt.is_none() && head.min <= 1 {
                            // fold the quantifier onto the group head instead
                            // of wrapping: the repeat ranges multiply
                            let t = self.fsm.token_mut(inner);
                            t.min *= min;
                            t.max = match (max, t.max) {
                                (None, _) | (_, None) => None,
                                (Some(a), Some(b)) => Some(a * b),
                            };
                            inner
                        } else {
                            let tok = self.fsm.new_token(inner, min, max, None);
                            self.fsm.connect(inner, tok);
                            tok
                        }
                    }
                }
                b'<' => {
                    self.bump();
                    let mut cc = CharClass::new();
                    loop {
                        match self.peek() {
                            Some(b'>') => break,
                            None => return Err(self.err(GrammarErrorKind::BadCharClass)),
                            Some(b'\\') if matches!(self.cur.get(1), Some(b'<' | b'>')) => {
                                cc.allow(self.cur[1]);
                                self.cur = &self.cur[2..];
                            }
                            Some(_) => {
                                let val = self.char_val()?;
                                if val == b'<' || val >= 128 {
                                    return Err(self.err(GrammarErrorKind::BadCharClass));
                                }
                                cc.allow(val);
                            }
                        }
                    }
                    self.bump();
                    let body = self.fsm.alloc(Node::Class(cc));
                    self.fsm.new_token(body, min, max, None)
                }
                b'"' => {
                    self.bump();
                    // find the closing quote not hidden behind a backslash;
                    // the word between is taken verbatim
                    let mut i = 0;
                    loop {
                        match self.cur.get(i) {
                            None => return Err(self.err(GrammarErrorKind::OpenString)),
                            Some(b'"') => break,
                            Some(b'\\') if self.cur.get(i + 1).is_some() => i += 2,
                            Some(_) => i += 1,
                        }
                    }
                    if i == 0 {
                        return Err(self.err(GrammarErrorKind::EmptyString));
                    }
                    let word = self.cur[..i].to_vec();
                    self.cur = &self.cur[i + 1..];
                    let body = self.fsm.alloc(Node::Literal(word.into_boxed_slice()));
                    self.fsm.new_token(body, min, max, None)
                }
                b'\'' => {
                    self.bump();
                    match self.peek() {
                        None | Some(b'\'') => {
                            return Err(self.err(GrammarErrorKind::BadSingleCharLit));
                        }
                        Some(_) => {}
                    }
                    let val = self.char_val()?;
                    if self.peek() != Some(b'\'') {
                        return Err(self.err(GrammarErrorKind::BadSingleCharLit));
                    }
                    self.bump();
                    if val >= 128 {
                        return Err(self.err(GrammarErrorKind::BadSingleCharLit));
                    }
                    let body = self.fsm.alloc(Node::Literal(Box::new([val])));
                    self.fsm.new_token(body, min, max, None)
                }
                b';' => {
                    // comment runs to end of line
                    self.cur = &[];
                    if term.is_none() {
                        break;
                    }
                    continue;
                }
                c => {
                    if !is_unreserved(c) {
                        return Err(self.err(GrammarErrorKind::UnexpectedToken(c as char)));
                    }
                    let end = self
                        .cur
                        .iter()
                        .position(|&b| !is_unreserved(b))
                        .unwrap_or(self.cur.len());
                    let name = std::str::from_utf8(&self.cur[..end])
                        .expect("unreserved characters are ascii")
                        .to_owned();
                    self.cur = &self.cur[end..];
                    let body = self.fsm.alloc(Node::Symbol(name.into_boxed_str()));
                    self.fsm.new_token(body, min, max, None)
                }
            };

            // inside a grouping, expressions may continue across lines
            if term.is_some() {
                if !self.next_non_ws() {
                    return Err(self.err(GrammarErrorKind::UnclosedGrouping));
                }
            } else {
                self.skip_ws();
            }

            let at_term = match term {
                None => self.cur.is_empty(),
                Some(t) => self.peek() == Some(t),
            };

            match grouping {
                Some(Grouping::Or) => {
                    if !at_term && self.peek() != Some(b'|') {
                        return Err(self.err(GrammarErrorKind::AndOrMix));
                    }
                    self.fsm.or_link(last.expect("or-group has a head"), token);
                }
                Some(Grouping::And) => {
                    if self.peek() == Some(b'|') {
                        return Err(self.err(GrammarErrorKind::AndOrMix));
                    }
                    self.fsm.connect(last.expect("and-group has a head"), token);
                }
                None => {
                    grouping =
                        Some(if self.peek() == Some(b'|') { Grouping::Or } else { Grouping::And });
                }
            }
            if self.peek() == Some(b'|') {
                self.bump();
            }

            last = Some(token);
            if ret.is_none() {
                ret = Some(token);
            }

            let done = match term {
                None => self.cur.is_empty(),
                Some(t) => self.peek() == Some(t),
            };
            if done {
                break;
            }
        }

        let root = ret.ok_or_else(|| self.err(GrammarErrorKind::UnexpectedEof))?;
        consolidate(&mut self.fsm, root);
        Ok(root)
    }

    // -------------------- symbol resolution --------------------

    /// DFS from the main rule replacing every symbol reference with a deep
    /// copy of the referenced rule. `Processing` marks detect circular
    /// definitions; rules never reached stay unmarked and are warned about.
    fn resolve_symbols(&mut self, main: NodeId) -> Result<(), GrammarError> {
        let mut marks = HashMap::new();
        self.resolve_rec(main, false, &mut marks)?;

        let rules = std::mem::take(&mut self.rules);
        for (name, root) in rules {
            if root == main {
                continue;
            }
            if !marks.contains_key(&root) {
                warn!(rule = %name, "unused grammar rule");
            }
            // referenced rules were deep-copied into place; the originals go
            self.fsm.release_graph(root);
        }
        Ok(())
    }

    fn resolve_rec(
        &mut self,
        id: NodeId,
        anonymous: bool,
        marks: &mut HashMap<NodeId, Mark>,
    ) -> Result<(), GrammarError> {
        if marks.contains_key(&id) {
            return Ok(());
        }
        marks.insert(id, if anonymous { Mark::Visited } else { Mark::Processing });

        let mut resolved_rule = None;
        let body = self.fsm.token(id).body;
        if let Node::Symbol(name) = self.fsm.node(body) {
            let name = name.to_string();
            let Some(&target) = self.rules.get(&name) else {
                return Err(GrammarError::global(GrammarErrorKind::UndefinedSymbol(name)));
            };
            if marks.get(&target) == Some(&Mark::Processing) {
                return Err(GrammarError::global(GrammarErrorKind::CircularDefinition));
            }
            marks.insert(target, Mark::Processing);

            // the reference becomes a private copy of the rule, looped back
            // to this token like any other sub-FSM
            let cpy = self.fsm.deep_copy(target);
            self.fsm.token_mut(id).body = cpy;
            self.fsm.add_ref(cpy);
            self.fsm.connect(cpy, id);
            self.fsm.unref(body);
            resolved_rule = Some(target);
        }

        let body = self.fsm.token(id).body;
        if self.fsm.is_token(body) {
            self.resolve_rec(body, true, marks)?;
        }
        if let Some(rule) = resolved_rule {
            marks.insert(rule, Mark::Visited);
        }

        let Token { alt, next, .. } = *self.fsm.token(id);
        if let Some(a) = alt {
            self.resolve_rec(a, true, marks)?;
        }
        if let Some(n) = next {
            self.resolve_rec(n, true, marks)?;
        }

        if anonymous {
            marks.remove(&id);
        } else {
            marks.insert(id, Mark::Visited);
        }
        Ok(())
    }
}
