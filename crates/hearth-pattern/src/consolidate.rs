//! Semantics-preserving FSM rewrites.
//!
//! Applied after compilation and idempotent. Four local rules, each legal
//! only under the guards spelled out at the call sites:
//!
//! - **token elevation**: a wrapper whose body is another token collapses
//!   into that token, multiplying repetition bounds
//! - **alt merge**: two alternatives that are single-character shapes with
//!   identical continuation fuse into one character class
//! - **sequential literal merge**: fixed-count adjacent literals become one
//!   longer literal
//! - **self-replication**: a fixed-count literal expands its own word
//!
//! Every edit keeps reference counts exact and frees nodes that drop to
//! zero.

use std::collections::HashSet;

use crate::fsm::{Fsm, Node, NodeId, Token};

pub(crate) fn consolidate(fsm: &mut Fsm, root: NodeId) {
    let mut seen = HashSet::new();
    consolidate_rec(fsm, Some(root), None, &mut seen);
}

fn consolidate_rec(
    fsm: &mut Fsm,
    id: Option<NodeId>,
    terminator: Option<NodeId>,
    seen: &mut HashSet<NodeId>,
) {
    let Some(id) = id else { return };
    if Some(id) == terminator {
        // looped back to the parent token being recursed from
        return;
    }
    if !seen.insert(id) {
        return;
    }

    try_elevate(fsm, id);

    let Token { body, next, alt, .. } = *fsm.token(id);
    consolidate_rec(fsm, next, terminator, seen);
    if alt.is_some() {
        consolidate_rec(fsm, alt, terminator, seen);
    }
    if fsm.is_token(body) {
        consolidate_rec(fsm, Some(body), Some(id), seen);
    }

    try_merge_alt(fsm, id);
    try_merge_literals(fsm, id);
}

fn single_char(fsm: &Fsm, id: NodeId) -> Option<u8> {
    match fsm.node(id) {
        Node::Literal(word) if word.len() == 1 => Some(word[0]),
        _ => None,
    }
}

/// Token elevation. Legal when `t.body` is a non-capturing token `b` and
/// either `t` is once-required and non-capturing, or `b` is the only path
/// back into `t` (`b.next == t`, `b.alt` empty) with bounds that compose.
fn try_elevate(fsm: &mut Fsm, id: NodeId) {
    let tok = *fsm.token(id);
    if !fsm.is_token(tok.body) {
        return;
    }
    let body_id = tok.body;
    let b = *fsm.token(body_id);
    if b.capture.is_some() {
        // a capturing body records its own offsets; it cannot take the
        // wrapper's place
        return;
    }
    let body_only = b.next == Some(id) && b.alt.is_none();
    let wrapper_once = tok.min == 1 && tok.max == Some(1);
    let eligible = (tok.capture.is_none() && (wrapper_once || (body_only && b.min <= 1)))
        || (body_only && b.min == 1 && b.max == Some(1));
    if !eligible {
        return;
    }

    // detach the sub-FSM's loop edges into the wrapper, then point any
    // references to `b` inside its own body at the wrapper's slot, which
    // `b`'s fields are about to occupy
    fsm.disconnect(body_id, id);
    if fsm.is_token(b.body) {
        fsm.reconnect(b.body, body_id, id);
    }

    let min = tok.min * b.min;
    let max = match (tok.max, b.max) {
        (None, _) | (_, None) => None,
        (Some(a), Some(c)) => Some(a * c),
    };

    // `b`'s links may have been trimmed by the disconnect above
    let moved = *fsm.token(body_id);
    *fsm.token_mut(id) = Token {
        body: moved.body,
        next: moved.next,
        alt: moved.alt,
        min,
        max,
        capture: tok.capture,
    };

    // rewire the wrapper's old continuations onto the elevated graph
    if let Some(n) = tok.next {
        fsm.dec_ref(n);
        fsm.connect(id, n);
    }
    if let Some(a) = tok.alt {
        fsm.dec_ref(a);
        fsm.or_link(id, a);
    }

    fsm.discard(body_id);
}

/// Alt merge: `t` and `t.alt` collapse into one char class when both are
/// single-character shapes, share a successor and bounds, and neither
/// captures.
fn try_merge_alt(fsm: &mut Fsm, id: NodeId) {
    let tok = *fsm.token(id);
    let Some(alt_id) = tok.alt else { return };
    let alt = *fsm.token(alt_id);

    if alt.next != tok.next
        || alt.max != Some(1)
        || tok.max != Some(1)
        || alt.min != tok.min
        || tok.capture.is_some()
        || alt.capture.is_some()
    {
        return;
    }

    let tok_char = single_char(fsm, tok.body);
    let alt_char = single_char(fsm, alt.body);
    let tok_is_class = fsm.is_class(tok.body);
    let alt_is_class = fsm.is_class(alt.body);

    let merged_body: NodeId = match (tok_char, tok_is_class, alt_char, alt_is_class) {
        (Some(tc), _, Some(ac), _) => {
            // two single-char literals fuse into a fresh class
            let mut cc = crate::class::CharClass::new();
            cc.allow(tc);
            cc.allow(ac);
            fsm.unref(tok.body);
            fsm.unref(alt.body);
            let cc_id = fsm.alloc(Node::Class(cc));
            fsm.add_ref(cc_id);
            cc_id
        }
        (None, true, Some(ac), _) => {
            // admit the alt's char into our class
            let Node::Class(cc) = fsm.node(tok.body) else { unreachable!() };
            let mut cc = *cc;
            cc.allow(ac);
            fsm.set_node(tok.body, Node::Class(cc));
            fsm.unref(alt.body);
            tok.body
        }
        (Some(tc), _, None, true) => {
            // move the alt's class over, admitting our char; the reference
            // gained here cancels the one lost with the alt token
            let Node::Class(cc) = fsm.node(alt.body) else { unreachable!() };
            let mut cc = *cc;
            cc.allow(tc);
            fsm.set_node(alt.body, Node::Class(cc));
            fsm.unref(tok.body);
            alt.body
        }
        (None, true, None, true) => {
            let Node::Class(acc) = fsm.node(alt.body) else { unreachable!() };
            let acc = *acc;
            let Node::Class(cc) = fsm.node(tok.body) else { unreachable!() };
            let mut cc = *cc;
            cc.merge(&acc);
            fsm.set_node(tok.body, Node::Class(cc));
            fsm.unref(alt.body);
            tok.body
        }
        _ => return,
    };

    // `t` absorbs the alternative: inherit its alt chain, drop the duplicate
    // successor edge, free the alt token (its count was 1 by invariant)
    let t = fsm.token_mut(id);
    t.body = merged_body;
    t.alt = alt.alt;
    if let Some(n) = alt.next {
        fsm.dec_ref(n);
    }
    fsm.discard(alt_id);
}

/// Sequential literal merge, and self-replication of a repeated literal.
fn try_merge_literals(fsm: &mut Fsm, id: NodeId) {
    let tok = *fsm.token(id);

    if let Some(next_id) = tok.next {
        let next = *fsm.token(next_id);
        if next.alt.is_none()
            && fsm.is_literal(tok.body)
            && fsm.is_literal(next.body)
            && tok.max == Some(tok.min)
            && next.max == Some(next.min)
            && fsm.ref_count(next_id) == 1
            && tok.capture.is_none()
            && next.capture.is_none()
        {
            let n = tok.min as usize;
            let m = next.min as usize;
            let Node::Literal(tw) = fsm.node(tok.body) else { unreachable!() };
            let Node::Literal(nw) = fsm.node(next.body) else { unreachable!() };
            let mut word = Vec::with_capacity(n * tw.len() + m * nw.len());
            for _ in 0..n {
                word.extend_from_slice(tw);
            }
            for _ in 0..m {
                word.extend_from_slice(nw);
            }

            let comb = fsm.alloc(Node::Literal(word.into_boxed_slice()));
            fsm.add_ref(comb);
            fsm.unref(tok.body);
            fsm.unref(next.body);

            let t = fsm.token_mut(id);
            t.body = comb;
            // take the successor's place; its single reference dies with it
            t.next = next.next;
            t.min = 1;
            t.max = Some(1);
            fsm.discard(next_id);
            return;
        }
    }

    if fsm.is_literal(tok.body) && tok.max == Some(tok.min) && tok.min > 1 {
        let n = tok.min as usize;
        let Node::Literal(w) = fsm.node(tok.body) else { unreachable!() };
        let word = w.repeat(n);

        let comb = fsm.alloc(Node::Literal(word.into_boxed_slice()));
        fsm.add_ref(comb);
        fsm.unref(tok.body);

        let t = fsm.token_mut(id);
        t.body = comb;
        t.min = 1;
        t.max = Some(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::CharClass, matcher::{Pattern, Span}};

    fn lit_token(fsm: &mut Fsm, word: &[u8], min: u32, max: Option<u32>) -> NodeId {
        let body = fsm.alloc(Node::Literal(word.to_vec().into_boxed_slice()));
        fsm.new_token(body, min, max, None)
    }

    fn digit_token(fsm: &mut Fsm, min: u32, max: Option<u32>, capture: Option<u32>) -> NodeId {
        let cc: CharClass = (b'0'..=b'9').collect();
        let body = fsm.alloc(Node::Class(cc));
        fsm.new_token(body, min, max, capture)
    }

    /// Reachable node count, for asserting that a rewrite actually shrank
    /// the graph.
    fn graph_size(fsm: &Fsm, root: NodeId) -> usize {
        fn walk(fsm: &Fsm, id: NodeId, seen: &mut std::collections::HashSet<NodeId>) {
            if !seen.insert(id) {
                return;
            }
            if let Node::Token(t) = fsm.node(id) {
                let Token { body, next, alt, .. } = *t;
                walk(fsm, body, seen);
                if let Some(n) = next {
                    walk(fsm, n, seen);
                }
                if let Some(a) = alt {
                    walk(fsm, a, seen);
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        walk(fsm, root, &mut seen);
        seen.len()
    }

    #[test]
    fn sequential_literals_merge() {
        let mut fsm = Fsm::new();
        let a = lit_token(&mut fsm, b"a", 1, Some(1));
        let b = lit_token(&mut fsm, b"b", 1, Some(1));
        let c = lit_token(&mut fsm, b"c", 1, Some(1));
        fsm.connect(a, b);
        fsm.connect(b, c);

        let mut pattern = Pattern { fsm, root: a, captures: 0 };
        assert!(pattern.is_match(b"abc"));
        pattern.consolidate();

        assert!(pattern.is_match(b"abc"));
        assert!(!pattern.is_match(b"ab"));
        assert!(!pattern.is_match(b"abcd"));
        pattern.check_consistency().unwrap();
        // one token over one literal "abc"
        assert_eq!(graph_size(&pattern.fsm, pattern.root), 2);
        let root = pattern.fsm.token(pattern.root);
        assert!(root.next.is_none());
        match pattern.fsm.node(root.body) {
            Node::Literal(w) => assert_eq!(&w[..], b"abc"),
            other => panic!("expected merged literal, found {other:?}"),
        }
    }

    #[test]
    fn repeated_literal_self_replicates() {
        let mut fsm = Fsm::new();
        let t = lit_token(&mut fsm, b"ab", 3, Some(3));
        let mut pattern = Pattern { fsm, root: t, captures: 0 };
        pattern.consolidate();

        assert!(pattern.is_match(b"ababab"));
        assert!(!pattern.is_match(b"abab"));
        pattern.check_consistency().unwrap();
        let root = pattern.fsm.token(pattern.root);
        assert_eq!((root.min, root.max), (1, Some(1)));
        match pattern.fsm.node(root.body) {
            Node::Literal(w) => assert_eq!(&w[..], b"ababab"),
            other => panic!("expected replicated literal, found {other:?}"),
        }
    }

    #[test]
    fn alternated_chars_merge_into_class() {
        let mut fsm = Fsm::new();
        let a = lit_token(&mut fsm, b"a", 1, Some(1));
        let b = lit_token(&mut fsm, b"b", 1, Some(1));
        let c = lit_token(&mut fsm, b"c", 1, Some(1));
        fsm.or_link(a, b);
        fsm.or_link(a, c);

        let mut pattern = Pattern { fsm, root: a, captures: 0 };
        pattern.consolidate();

        for input in [b"a", b"b", b"c"] {
            assert!(pattern.is_match(input));
        }
        assert!(!pattern.is_match(b"d"));
        assert!(!pattern.is_match(b"ab"));
        pattern.check_consistency().unwrap();
        // all three alternatives fused into a single class token
        assert_eq!(graph_size(&pattern.fsm, pattern.root), 2);
    }

    #[test]
    fn consolidation_preserves_captures() {
        // {3*3 digit} "-" {3*3 digit} "-" 4*4 digit, built by hand so the
        // pre-consolidation FSM can be exercised first
        fn build() -> Pattern {
            let mut fsm = Fsm::new();
            let area = digit_token(&mut fsm, 3, Some(3), None);
            let g0 = fsm.new_token(area, 1, Some(1), Some(0));
            fsm.connect(area, g0);
            let d0 = lit_token(&mut fsm, b"-", 1, Some(1));
            let mid = digit_token(&mut fsm, 3, Some(3), None);
            let g1 = fsm.new_token(mid, 1, Some(1), Some(1));
            fsm.connect(mid, g1);
            let d1 = lit_token(&mut fsm, b"-", 1, Some(1));
            let tail = digit_token(&mut fsm, 4, Some(4), None);
            fsm.connect(g0, d0);
            fsm.connect(d0, g1);
            fsm.connect(g1, d1);
            fsm.connect(d1, tail);
            Pattern { fsm, root: g0, captures: 2 }
        }

        let reference = build();
        let mut caps_before = [None; 2];
        reference.match_full(b"314-159-2653", &mut caps_before).unwrap();

        let mut pattern = build();
        pattern.consolidate();
        pattern.check_consistency().unwrap();
        let mut caps_after = [None; 2];
        pattern.match_full(b"314-159-2653", &mut caps_after).unwrap();

        assert_eq!(caps_before, caps_after);
        assert_eq!(caps_after[0], Some(Span { start: 0, end: 3 }));
        assert_eq!(caps_after[1], Some(Span { start: 4, end: 7 }));

        for bad in [&b"314-1f9-2653"[..], b"314-159-265", b"314-159-26533"] {
            assert_eq!(
                pattern.match_full(bad, &mut caps_after),
                Err(crate::error::MatchError::Fail)
            );
        }
    }

    #[test]
    fn consolidation_is_idempotent() {
        let mut fsm = Fsm::new();
        let a = lit_token(&mut fsm, b"ha", 2, Some(2));
        let b = lit_token(&mut fsm, b"!", 1, Some(1));
        fsm.connect(a, b);
        let mut pattern = Pattern { fsm, root: a, captures: 0 };

        pattern.consolidate();
        let size = graph_size(&pattern.fsm, pattern.root);
        pattern.consolidate();
        assert_eq!(graph_size(&pattern.fsm, pattern.root), size);
        assert!(pattern.is_match(b"haha!"));
        pattern.check_consistency().unwrap();
    }

    #[test]
    fn optional_wrapper_elevates() {
        // [x] lowers to a 0*1 wrapper around a 1*1 token; elevation folds
        // the pair into a single 0*1 token
        let mut fsm = Fsm::new();
        let x = lit_token(&mut fsm, b"x", 1, Some(1));
        let wrap = fsm.new_token(x, 0, Some(1), None);
        fsm.connect(x, wrap);
        let tail = lit_token(&mut fsm, b"y", 1, Some(1));
        fsm.connect(wrap, tail);

        let mut pattern = Pattern { fsm, root: wrap, captures: 0 };
        pattern.consolidate();

        assert!(pattern.is_match(b"xy"));
        assert!(pattern.is_match(b"y"));
        assert!(!pattern.is_match(b"xxy"));
        pattern.check_consistency().unwrap();
        let root = pattern.fsm.token(pattern.root);
        assert_eq!((root.min, root.max), (0, Some(1)));
        assert!(pattern.fsm.is_literal(root.body));
    }
}
