//! Arena-backed pattern graph.
//!
//! Patterns are a finite state machine of tokens wired together by `next`
//! (successor after successful consumption) and `alt` (alternative tried on
//! failure) edges. A token's body is a literal, a character class, or another
//! token; a sub-token FSM leads back to its parent on every non-failing path.
//!
//! Nodes live in an arena and address each other by index, so the back edges
//! from a sub-FSM to its parent are plain non-owning indices. Reference
//! counts track incoming edges and gate slot reuse during consolidation
//! edits; retiring a whole pattern just drops the arena.
//!
//! Formation invariants (checked by [`Fsm::validate`]):
//! - the graph is acyclic along `next`/`alt` edges
//! - a token that is another token's `alt` has exactly one reference
//! - every token has a body

use std::collections::{HashMap, HashSet};

use hearth_utils::safe_assert;

use crate::class::CharClass;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct NodeId(u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Node {
    /// Byte string matched exactly, length ≥ 1.
    Literal(Box<[u8]>),
    Class(CharClass),
    Token(Token),
    /// Named reference awaiting resolution; only present mid-compilation.
    Symbol(Box<str>),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Token {
    pub body: NodeId,
    pub next: Option<NodeId>,
    pub alt: Option<NodeId>,
    /// Minimum adjacent consumptions before `next` may be taken.
    pub min: u32,
    /// Maximum adjacent consumptions; `None` is unbounded.
    pub max: Option<u32>,
    /// Capture slot written by this token, in grammar declaration order.
    pub capture: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    node: Node,
    refs: u32,
}

#[derive(Debug)]
pub(crate) struct Fsm {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl Fsm {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Upper bound over all ids ever allocated; sizes per-match scratch.
    pub fn slot_bound(&self) -> usize {
        self.slots.len()
    }

    /// Raw slot index of `id`, for scratch tables sized by
    /// [`Fsm::slot_bound`].
    pub fn slot_index(&self, id: NodeId) -> usize {
        id.idx()
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(Slot { node, refs: 0 });
            return NodeId(idx);
        }
        self.slots.push(Some(Slot { node, refs: 0 }));
        NodeId((self.slots.len() - 1) as u32)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.slots[id.idx()].as_ref().expect("dangling node id").node
    }

    pub fn token(&self, id: NodeId) -> &Token {
        match self.node(id) {
            Node::Token(t) => t,
            other => panic!("expected token, found {other:?}"),
        }
    }

    pub fn token_mut(&mut self, id: NodeId) -> &mut Token {
        match &mut self.slots[id.idx()].as_mut().expect("dangling node id").node {
            Node::Token(t) => t,
            other => panic!("expected token, found {other:?}"),
        }
    }

    pub fn set_node(&mut self, id: NodeId, node: Node) {
        self.slots[id.idx()].as_mut().expect("dangling node id").node = node;
    }

    pub fn is_token(&self, id: NodeId) -> bool {
        matches!(self.node(id), Node::Token(_))
    }

    pub fn is_literal(&self, id: NodeId) -> bool {
        matches!(self.node(id), Node::Literal(_))
    }

    pub fn is_class(&self, id: NodeId) -> bool {
        matches!(self.node(id), Node::Class(_))
    }

    pub fn ref_count(&self, id: NodeId) -> u32 {
        self.slots[id.idx()].as_ref().expect("dangling node id").refs
    }

    pub fn add_ref(&mut self, id: NodeId) {
        self.slots[id.idx()].as_mut().expect("dangling node id").refs += 1;
    }

    pub fn dec_ref(&mut self, id: NodeId) {
        let slot = self.slots[id.idx()].as_mut().expect("dangling node id");
        safe_assert!(slot.refs > 0, "reference count underflow");
        slot.refs = slot.refs.saturating_sub(1);
    }

    /// Drops a reference and frees the slot once unreferenced. The node's
    /// own outgoing links are not followed; callers transfer or release
    /// those explicitly.
    pub fn unref(&mut self, id: NodeId) {
        self.dec_ref(id);
        if self.ref_count(id) == 0 {
            self.discard(id);
        }
    }

    /// Frees a slot outright, regardless of its count. Used when an edit has
    /// already transferred the node's identity elsewhere.
    pub fn discard(&mut self, id: NodeId) {
        self.slots[id.idx()] = None;
        self.free.push(id.0);
    }

    /// Allocates a token wrapping `body`, accounting for the new edge.
    pub fn new_token(
        &mut self,
        body: NodeId,
        min: u32,
        max: Option<u32>,
        capture: Option<u32>,
    ) -> NodeId {
        let id = self.alloc(Node::Token(Token { body, next: None, alt: None, min, max, capture }));
        self.add_ref(body);
        id
    }

    // -------------------- graph surgery --------------------

    /// Points every dangling `next` inside `from`'s graph at `to`: rule
    /// `from` must be followed by rule `to`. Returns whether any link was
    /// made.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        self.connect_rec(from, to, &mut seen)
    }

    fn connect_rec(&mut self, id: NodeId, to: NodeId, seen: &mut HashSet<NodeId>) -> bool {
        if !seen.insert(id) {
            return false;
        }
        let Token { next, alt, .. } = *self.token(id);
        let mut did = false;
        match next {
            None => {
                self.token_mut(id).next = Some(to);
                self.add_ref(to);
                did = true;
            }
            Some(n) if n == to => {}
            Some(n) => did |= self.connect_rec(n, to, seen),
        }
        if let Some(a) = alt {
            did |= self.connect_rec(a, to, seen);
        }
        did
    }

    /// Redirects every `next`/`alt` edge inside `root`'s graph that points
    /// at `from` to point at `to` instead.
    pub fn reconnect(&mut self, root: NodeId, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        self.reconnect_rec(root, from, to, &mut seen)
    }

    fn reconnect_rec(
        &mut self,
        id: NodeId,
        from: NodeId,
        to: NodeId,
        seen: &mut HashSet<NodeId>,
    ) -> bool {
        if !seen.insert(id) {
            return false;
        }
        let Token { next, alt, .. } = *self.token(id);
        let mut did = false;
        match next {
            Some(n) if n == from => {
                self.token_mut(id).next = Some(to);
                self.add_ref(to);
                self.dec_ref(from);
                did = true;
            }
            Some(n) if n == to => {}
            Some(n) => did |= self.reconnect_rec(n, from, to, seen),
            None => {}
        }
        match alt {
            Some(a) if a == from => {
                self.token_mut(id).alt = Some(to);
                self.add_ref(to);
                self.dec_ref(from);
                did = true;
            }
            Some(a) => did |= self.reconnect_rec(a, from, to, seen),
            None => {}
        }
        did
    }

    /// Removes every `next`/`alt` edge inside `root`'s graph that points at
    /// `from`, undoing a previous [`Fsm::connect`].
    pub fn disconnect(&mut self, root: NodeId, from: NodeId) -> bool {
        let mut seen = HashSet::new();
        self.disconnect_rec(root, from, &mut seen)
    }

    fn disconnect_rec(&mut self, id: NodeId, from: NodeId, seen: &mut HashSet<NodeId>) -> bool {
        if !seen.insert(id) {
            return false;
        }
        let Token { next, alt, .. } = *self.token(id);
        let mut did = false;
        match next {
            Some(n) if n == from => {
                self.token_mut(id).next = None;
                self.dec_ref(from);
                did = true;
            }
            Some(n) => did |= self.disconnect_rec(n, from, seen),
            None => {}
        }
        match alt {
            Some(a) if a == from => {
                self.token_mut(id).alt = None;
                self.dec_ref(from);
                did = true;
            }
            Some(a) => did |= self.disconnect_rec(a, from, seen),
            None => {}
        }
        did
    }

    /// Appends `opt` to the end of `id`'s alternative chain.
    pub fn or_link(&mut self, id: NodeId, opt: NodeId) {
        let mut cur = id;
        while let Some(a) = self.token(cur).alt {
            cur = a;
        }
        self.token_mut(cur).alt = Some(opt);
        self.add_ref(opt);
    }

    /// Deep copy of the token graph rooted at `root`. Tokens are duplicated;
    /// literal and class leaves are shared with a bumped count.
    pub fn deep_copy(&mut self, root: NodeId) -> NodeId {
        let mut map = HashMap::new();
        self.deep_copy_rec(root, &mut map)
    }

    fn deep_copy_rec(&mut self, id: NodeId, map: &mut HashMap<NodeId, NodeId>) -> NodeId {
        if let Some(&copy) = map.get(&id) {
            return copy;
        }
        let src = *self.token(id);
        let copy = self.alloc(Node::Token(Token {
            body: src.body,
            next: None,
            alt: None,
            min: src.min,
            max: src.max,
            capture: src.capture,
        }));
        map.insert(id, copy);

        if let Some(a) = src.alt {
            let ca = self.deep_copy_rec(a, map);
            self.token_mut(copy).alt = Some(ca);
            self.add_ref(ca);
        }
        if let Some(n) = src.next {
            let cn = self.deep_copy_rec(n, map);
            self.token_mut(copy).next = Some(cn);
            self.add_ref(cn);
        }
        let body = if self.is_token(src.body) {
            self.deep_copy_rec(src.body, map)
        } else {
            src.body
        };
        self.token_mut(copy).body = body;
        self.add_ref(body);
        copy
    }

    /// Releases the whole graph rooted at `root`: every edge gives up its
    /// reference and every node that reaches zero is freed. The root itself
    /// is freed unconditionally.
    pub fn release_graph(&mut self, root: NodeId) {
        // shield the root so no interior edge frees it first
        self.add_ref(root);
        let mut seen = HashSet::new();
        self.release_rec(root, &mut seen);
        self.discard(root);
    }

    fn release_rec(&mut self, id: NodeId, seen: &mut HashSet<NodeId>) {
        if !seen.insert(id) {
            return;
        }
        let Token { body, next, alt, .. } = *self.token(id);
        if self.is_token(body) {
            self.release_rec(body, seen);
        }
        self.unref(body);
        if let Some(a) = alt {
            self.release_rec(a, seen);
            self.unref(a);
        }
        if let Some(n) = next {
            self.release_rec(n, seen);
            self.unref(n);
        }
    }

    // -------------------- consistency --------------------

    /// Verifies the formation invariants for the graph reachable from
    /// `root`: exact reference counts, acyclic `next`/`alt` edges,
    /// single-reference alt targets, and a present body on every token.
    pub fn validate(&self, root: NodeId) -> Result<(), String> {
        let mut incoming: HashMap<NodeId, u32> = HashMap::new();
        let mut alt_targets: HashSet<NodeId> = HashSet::new();
        let mut seen = HashSet::new();
        self.count_edges(root, &mut incoming, &mut alt_targets, &mut seen)?;

        for &id in &seen {
            let counted = incoming.get(&id).copied().unwrap_or(0);
            let stored = self.ref_count(id);
            if counted != stored {
                return Err(format!(
                    "node {id:?} stores {stored} references but has {counted} incoming edges"
                ));
            }
            if alt_targets.contains(&id) && stored != 1 {
                return Err(format!("alt target {id:?} has reference count {stored}"));
            }
        }

        let mut colors = HashMap::new();
        self.check_acyclic(root, &mut colors)
    }

    fn count_edges(
        &self,
        id: NodeId,
        incoming: &mut HashMap<NodeId, u32>,
        alt_targets: &mut HashSet<NodeId>,
        seen: &mut HashSet<NodeId>,
    ) -> Result<(), String> {
        if !seen.insert(id) {
            return Ok(());
        }
        match self.node(id) {
            Node::Literal(word) => {
                if word.is_empty() {
                    return Err(format!("literal {id:?} is empty"));
                }
            }
            Node::Class(_) => {}
            Node::Symbol(name) => {
                return Err(format!("unresolved symbol \"{name}\" survived compilation"));
            }
            Node::Token(t) => {
                let Token { body, next, alt, .. } = *t;
                *incoming.entry(body).or_insert(0) += 1;
                self.count_edges(body, incoming, alt_targets, seen)?;
                if let Some(n) = next {
                    *incoming.entry(n).or_insert(0) += 1;
                    self.count_edges(n, incoming, alt_targets, seen)?;
                }
                if let Some(a) = alt {
                    *incoming.entry(a).or_insert(0) += 1;
                    alt_targets.insert(a);
                    self.count_edges(a, incoming, alt_targets, seen)?;
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self, id: NodeId, colors: &mut HashMap<NodeId, u8>) -> Result<(), String> {
        const OPEN: u8 = 1;
        const DONE: u8 = 2;
        match colors.get(&id) {
            Some(&OPEN) => return Err(format!("cycle through {id:?} along next/alt edges")),
            Some(&DONE) => return Ok(()),
            _ => {}
        }
        colors.insert(id, OPEN);
        if let Node::Token(t) = self.node(id) {
            let Token { body, next, alt, .. } = *t;
            if let Some(n) = next {
                self.check_acyclic(n, colors)?;
            }
            if let Some(a) = alt {
                self.check_acyclic(a, colors)?;
            }
            // a sub-FSM is its own acyclicity domain: edges back to the
            // parent are the expected loop closure, everything else must
            // stay acyclic
            if self.is_token(body) {
                let mut inner = HashMap::new();
                self.check_acyclic_sub(body, id, &mut inner)?;
            }
        }
        colors.insert(id, DONE);
        Ok(())
    }

    fn check_acyclic_sub(
        &self,
        id: NodeId,
        parent: NodeId,
        colors: &mut HashMap<NodeId, u8>,
    ) -> Result<(), String> {
        const OPEN: u8 = 1;
        const DONE: u8 = 2;
        if id == parent {
            return Ok(());
        }
        match colors.get(&id) {
            Some(&OPEN) => return Err(format!("cycle through {id:?} along next/alt edges")),
            Some(&DONE) => return Ok(()),
            _ => {}
        }
        colors.insert(id, OPEN);
        if let Node::Token(t) = self.node(id) {
            let Token { body, next, alt, .. } = *t;
            if let Some(n) = next {
                self.check_acyclic_sub(n, parent, colors)?;
            }
            if let Some(a) = alt {
                self.check_acyclic_sub(a, parent, colors)?;
            }
            if self.is_token(body) && body != parent {
                let mut inner = HashMap::new();
                self.check_acyclic_sub(body, id, &mut inner)?;
            }
        }
        colors.insert(id, DONE);
        Ok(())
    }
}
