//! Depth-first backtracking matcher.
//!
//! A token consumes its body while its repetition counter allows, then tries
//! its `next` once at least `min` consumptions happened, and falls back to
//! its `alt` only when it consumed nothing. A match is found when some path
//! fully consumes the input and ends on a token whose `next` is empty.
//!
//! Repetition counters and provisional capture ends live in per-call scratch
//! tables indexed by node id, so a compiled [`Pattern`] is immutable and can
//! be shared freely across threads.

use crate::{
    error::MatchError,
    fsm::{Fsm, Node, NodeId, Token},
};

/// Half-open byte range captured by a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// A compiled pattern: the arena, its entry token and the number of capture
/// groups the grammar declared.
#[derive(Debug)]
pub struct Pattern {
    pub(crate) fsm: Fsm,
    pub(crate) root: NodeId,
    pub(crate) captures: u32,
}

struct Scratch {
    /// Per-token adjacent-consumption counters, indexed by node id.
    counts: Vec<u32>,
    /// Provisional end offset per capture group, fixed up on success.
    ends: Vec<usize>,
}

impl Pattern {
    /// Number of capture groups declared by the grammar this pattern was
    /// compiled from.
    pub fn capture_count(&self) -> usize {
        self.captures as usize
    }

    /// Anchored match of `input` against the whole pattern.
    ///
    /// On success, every capturing group on the matched path has its span
    /// written to `caps[group_index]`; untouched slots are `None`. A
    /// capturing group whose index exceeds `caps` aborts with
    /// [`MatchError::Overflow`].
    pub fn match_full(
        &self,
        input: &[u8],
        caps: &mut [Option<Span>],
    ) -> Result<(), MatchError> {
        caps.fill(None);
        let mut scratch = Scratch {
            counts: vec![0; self.fsm.slot_bound()],
            ends: vec![0; self.captures as usize],
        };
        self.step(Some(self.root), input, 0, &mut scratch, caps)
    }

    /// Convenience wrapper for patterns used as plain validators.
    pub fn is_match(&self, input: &[u8]) -> bool {
        let mut caps = vec![None; self.captures as usize];
        self.match_full(input, &mut caps).is_ok()
    }

    /// Runs the formation-invariant checker over the compiled graph.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.fsm.validate(self.root)
    }

    /// Re-applies the consolidation pass. Compilation already consolidates
    /// and the rewrite is idempotent, so this never changes match behavior.
    pub fn consolidate(&mut self) {
        crate::consolidate::consolidate(&mut self.fsm, self.root);
    }

    fn step(
        &self,
        id: Option<NodeId>,
        input: &[u8],
        pos: usize,
        scratch: &mut Scratch,
        caps: &mut [Option<Span>],
    ) -> Result<(), MatchError> {
        let Some(id) = id else {
            // the path ends here; it matches iff the input is spent
            return if pos == input.len() { Ok(()) } else { Err(MatchError::Fail) };
        };

        let Token { body, next, alt, min, max, capture } = *self.fsm.token(id);
        let count = scratch.counts[self.idx(id)];
        let mut ret = Err(MatchError::Fail);

        if max.is_none_or(|m| count < m) {
            // tentatively consume the body once more
            scratch.counts[self.idx(id)] = count + 1;
            ret = match self.fsm.node(body) {
                Node::Class(cc) => {
                    if pos < input.len() && cc.contains(input[pos]) {
                        self.step(Some(id), input, pos + 1, scratch, caps)
                    } else {
                        Err(MatchError::Fail)
                    }
                }
                Node::Literal(word) => {
                    if input[pos..].starts_with(word) {
                        self.step(Some(id), input, pos + word.len(), scratch, caps)
                    } else {
                        Err(MatchError::Fail)
                    }
                }
                Node::Token(_) => self.step(Some(body), input, pos, scratch, caps),
                Node::Symbol(name) => unreachable!("unresolved symbol \"{name}\" in matcher"),
            };
            scratch.counts[self.idx(id)] = count;
            if ret == Err(MatchError::Overflow) {
                return ret;
            }
        }

        if ret.is_err() {
            // consumption stopped at `pos`: the deepest frame to record this
            // defines the group's provisional end offset
            if let Some(g) = capture {
                scratch.ends[g as usize] = pos;
            }
            if count >= min {
                // enough consumed; hand the input over to the successor
                scratch.counts[self.idx(id)] = 0;
                let r = self.step(next, input, pos, scratch, caps);
                scratch.counts[self.idx(id)] = count;
                if r == Err(MatchError::Overflow) {
                    return r;
                }
                if r.is_ok() {
                    ret = r;
                }
            }
        }

        if ret.is_ok() && count == 0 {
            // outermost frame of a successful walk through this group
            if let Some(g) = capture {
                let g = g as usize;
                if g >= caps.len() {
                    return Err(MatchError::Overflow);
                }
                caps[g] = Some(Span { start: pos, end: scratch.ends[g] });
            }
        }

        if ret.is_err() && count == 0 && alt.is_some() {
            let r = self.step(alt, input, pos, scratch, caps);
            if r == Err(MatchError::Overflow) {
                return r;
            }
            if r.is_ok() {
                ret = r;
            }
        }

        if ret.is_err() {
            // the whole group backtracked out; forget its capture
            if let Some(g) = capture {
                if (g as usize) < caps.len() {
                    caps[g as usize] = None;
                }
            }
        }

        ret
    }

    fn idx(&self, id: NodeId) -> usize {
        // NodeId is opaque outside the fsm module; route through the arena
        self.fsm.slot_index(id)
    }
}
