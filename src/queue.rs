//! Bounded FIFO of deferred commands with dependency edges.
//!
//! Commands that share an operand identity must execute in the order they
//! were queued. Edges are computed once, on enqueue, by intersecting the new
//! command's identity tokens with the token set of every command already
//! queued. Edges are sequence numbers rather than references, a number that
//! no longer resolves in the queue simply means the dependency already ran.

use crate::array::ArrayId;
use crate::dtype::DType;
use std::collections::VecDeque;

pub(crate) type Seq = u64;

/// Identity tokens are distinguished from literals and parameters purely
/// by this lexical convention.
pub(crate) fn is_identity_token(token: &str) -> bool {
    token.starts_with("id_")
}

#[derive(Debug)]
pub(crate) struct Command {
    pub seq: Seq,
    /// Server side command name
    pub cmd: Box<str>,
    /// Space delimited arguments, identities still in logical form
    pub args: String,
    /// Binary payload, if any
    pub payload: Option<Vec<u8>>,
    /// The reply is a binary frame rather than an envelope
    pub recv_bytes: bool,
    /// Identity of the handle this command materializes, if any
    pub target: Option<ArrayId>,
    /// The reply describes the created array and must be parsed
    pub parses_created: bool,
    pub executed: bool,
    /// Commands that must run first, in queue order, deduplicated
    pub deps: Vec<Seq>,
    /// Handles whose destruction waits for this command
    pub carried: Vec<(ArrayId, DType, u64)>,
}

impl Command {
    fn references(&self, token: &str) -> bool {
        self.args.split(' ').any(|t| t == token)
    }
}

#[derive(Debug)]
pub(crate) struct CommandQueue {
    items: VecDeque<Command>,
    capacity: usize,
    next_seq: Seq,
}

impl CommandQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        CommandQueue { items: VecDeque::new(), capacity: capacity.max(1), next_seq: 0 }
    }

    pub(crate) fn is_at_capacity(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Queue a command, computing its dependency edges against everything
    /// currently queued. Returns the command's sequence number.
    pub(crate) fn enqueue(
        &mut self,
        cmd: &str,
        args: String,
        payload: Option<Vec<u8>>,
        recv_bytes: bool,
        target: Option<ArrayId>,
        parses_created: bool,
    ) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        let own_tokens: Vec<&str> = args.split(' ').filter(|t| is_identity_token(t)).collect();
        let mut deps = Vec::new();
        for item in &self.items {
            let mut hit = item.args.split(' ').any(|t| own_tokens.contains(&t));
            if !hit {
                if let Some(target) = item.target {
                    let token = target.to_string();
                    hit = own_tokens.contains(&token.as_str());
                }
            }
            if hit && !deps.contains(&item.seq) {
                deps.push(item.seq);
            }
        }
        self.items.push_back(Command {
            seq,
            cmd: cmd.into(),
            args,
            payload,
            recv_bytes,
            target,
            parses_created,
            executed: false,
            deps,
            carried: Vec::new(),
        });
        seq
    }

    pub(crate) fn contains(&self, seq: Seq) -> bool {
        self.items.iter().any(|c| c.seq == seq)
    }

    pub(crate) fn get(&self, seq: Seq) -> Option<&Command> {
        self.items.iter().find(|c| c.seq == seq)
    }

    pub(crate) fn front_seq(&self) -> Option<Seq> {
        self.items.front().map(|c| c.seq)
    }

    /// Remove one command, preserving the relative order of the rest.
    pub(crate) fn remove(&mut self, seq: Seq) -> Option<Command> {
        let pos = self.items.iter().position(|c| c.seq == seq)?;
        self.items.remove(pos)
    }

    /// Most recently queued command whose arguments mention `token`.
    pub(crate) fn find_newest_referencing(&mut self, token: &str) -> Option<&mut Command> {
        self.items.iter_mut().rev().find(|c| c.references(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> CommandQueue {
        CommandQueue::new(8)
    }

    #[test]
    fn edges_follow_shared_identities() {
        let mut q = queue();
        let a = q.enqueue("binopvv", "+ id_1_0 id_2_0".into(), None, false, Some(ArrayId::new(3, 0)), true);
        let b = q.enqueue("binopvv", "* id_4_0 id_5_0".into(), None, false, Some(ArrayId::new(6, 0)), true);
        // Depends on `a` through both an argument and a target identity.
        let c = q.enqueue("binopvv", "- id_1_0 id_3_0".into(), None, false, Some(ArrayId::new(7, 0)), true);
        assert_eq!(q.get(c).unwrap().deps, [a]);
        let d = q.enqueue("reduction", "sum id_6_0".into(), None, false, None, false);
        assert_eq!(q.get(d).unwrap().deps, [b]);
    }

    #[test]
    fn edges_are_deduplicated_and_in_queue_order() {
        let mut q = queue();
        let a = q.enqueue("binopvv", "+ id_1_0 id_2_0".into(), None, false, Some(ArrayId::new(3, 0)), true);
        let b = q.enqueue("opeqvv", "+= id_3_0 id_1_0".into(), None, false, None, false);
        // Mentions id_3_0 (a's target and b's argument) and id_1_0 (argument
        // of both), still exactly one edge per command, oldest first.
        let c = q.enqueue("binopvv", "* id_3_0 id_1_0".into(), None, false, Some(ArrayId::new(9, 0)), true);
        assert_eq!(q.get(c).unwrap().deps, [a, b]);
    }

    #[test]
    fn literals_are_not_identities() {
        let mut q = queue();
        q.enqueue("binopvs", "+ id_1_0 int64 5".into(), None, false, Some(ArrayId::new(2, 0)), true);
        let b = q.enqueue("binopvs", "* id_9_0 int64 5".into(), None, false, Some(ArrayId::new(4, 0)), true);
        assert!(q.get(b).unwrap().deps.is_empty());
    }

    #[test]
    fn removal_preserves_relative_order() {
        let mut q = queue();
        let a = q.enqueue("create", "int64 10".into(), None, false, Some(ArrayId::new(1, 0)), true);
        let b = q.enqueue("create", "int64 20".into(), None, false, Some(ArrayId::new(2, 0)), true);
        let c = q.enqueue("create", "int64 30".into(), None, false, Some(ArrayId::new(3, 0)), true);
        assert!(q.remove(b).is_some());
        assert_eq!(q.front_seq(), Some(a));
        assert!(q.remove(a).is_some());
        assert_eq!(q.front_seq(), Some(c));
        assert!(q.remove(b).is_none());
    }

    #[test]
    fn newest_referencing_scan_runs_backwards() {
        let mut q = queue();
        q.enqueue("reduction", "sum id_1_0".into(), None, false, None, false);
        let b = q.enqueue("reduction", "prod id_1_0".into(), None, false, None, false);
        assert_eq!(q.find_newest_referencing("id_1_0").unwrap().seq, b);
        assert!(q.find_newest_referencing("id_7_0").is_none());
    }
}
