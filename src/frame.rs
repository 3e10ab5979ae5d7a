use crate::Value;
use std::collections::HashMap;

/// A lexical activation record. `start`/`end`/`anchor` stay at their
/// defaults on plain block scopes; they are only set on frames installed by
/// the FRAME instruction (calls) or marked by ANCHOR (loops).
#[derive(Debug, Default)]
pub struct Frame {
    pub parent: Option<usize>,
    pub declared: HashMap<String, Value>,
    pub start: Option<usize>,
    pub end: Option<usize>,
    pub anchor: bool,
}

/// Arena of frames with index-based parent links. Children are always
/// created after their parents and liveness is rooted solely at the current
/// frame, so every slot above `current` is unreachable and unwinding is a
/// truncate.
#[derive(Debug)]
pub struct Frames {
    arena: Vec<Frame>,
    current: usize,
}

impl Frames {
    pub fn new() -> Self {
        Self {
            arena: vec![Frame::default()],
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn is_root(&self) -> bool {
        self.current == 0
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.arena[index]
    }

    /// Enter a plain block scope.
    pub fn enter(&mut self) {
        self.arena.push(Frame {
            parent: Some(self.current),
            ..Frame::default()
        });
        self.current = self.arena.len() - 1;
    }

    /// Install a call frame with its return bookkeeping set.
    pub fn enter_framed(&mut self, start: usize, end: usize) {
        self.arena.push(Frame {
            parent: Some(self.current),
            start: Some(start),
            end: Some(end),
            ..Frame::default()
        });
        self.current = self.arena.len() - 1;
    }

    /// Leave the current scope. Returns false at the root frame.
    pub fn leave(&mut self) -> bool {
        match self.arena[self.current].parent {
            Some(parent) => {
                self.current = parent;
                self.arena.truncate(self.current + 1);
                true
            }
            None => false,
        }
    }

    pub fn set_anchor(&mut self, anchor: bool) {
        self.arena[self.current].anchor = anchor;
    }

    /// Nearest frame, starting at the current one, installed by FRAME.
    pub fn framed_ancestor(&self) -> Option<usize> {
        let mut index = self.current;
        loop {
            let frame = &self.arena[index];
            if frame.end.is_some() {
                return Some(index);
            }
            index = frame.parent?;
        }
    }

    /// Nearest frame, starting at the current one, with the anchor flag set.
    pub fn anchored_ancestor(&self) -> Option<usize> {
        let mut index = self.current;
        loop {
            let frame = &self.arena[index];
            if frame.anchor {
                return Some(index);
            }
            index = frame.parent?;
        }
    }

    /// Make `index` current, discarding everything entered since.
    pub fn unwind_to(&mut self, index: usize) {
        self.current = index;
        self.arena.truncate(index + 1);
    }

    /// Pop the frame at `index` together with everything below it, making
    /// its parent current. Returns false if `index` is the root.
    pub fn unwind_past(&mut self, index: usize) -> bool {
        match self.arena[index].parent {
            Some(parent) => {
                self.current = parent;
                self.arena.truncate(self.current + 1);
                true
            }
            None => false,
        }
    }

    /// Bind `name` in the current frame, shadowing any outer binding.
    pub fn declare(&mut self, name: &str, value: Value) {
        self.arena[self.current]
            .declared
            .insert(name.to_string(), value);
    }

    /// Assign to the nearest existing declaration of `name`. Silently does
    /// nothing when no scope in the chain declares it.
    pub fn assign(&mut self, name: &str, value: Value) {
        let mut index = self.current;
        loop {
            if let Some(slot) = self.arena[index].declared.get_mut(name) {
                *slot = value;
                return;
            }
            match self.arena[index].parent {
                Some(parent) => index = parent,
                None => return,
            }
        }
    }

    /// Look `name` up along the parent chain; nil when absent.
    pub fn get(&self, name: &str) -> Value {
        let mut index = self.current;
        loop {
            if let Some(value) = self.arena[index].declared.get(name) {
                return value.clone();
            }
            match self.arena[index].parent {
                Some(parent) => index = parent,
                None => return Value::Nil,
            }
        }
    }

    pub fn root(&self) -> &Frame {
        &self.arena[0]
    }
}

impl Default for Frames {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_and_lookup_walk_the_chain() {
        let mut frames = Frames::new();
        frames.declare("x", Value::Float(1.0));
        frames.enter();
        assert_eq!(frames.get("x"), Value::Float(1.0));
        assert_eq!(frames.get("missing"), Value::Nil);
    }

    #[test]
    fn test_declare_shadows_outer_binding() {
        let mut frames = Frames::new();
        frames.declare("x", Value::Float(1.0));
        frames.enter();
        frames.declare("x", Value::Float(2.0));
        assert_eq!(frames.get("x"), Value::Float(2.0));
        assert!(frames.leave());
        assert_eq!(frames.get("x"), Value::Float(1.0));
    }

    #[test]
    fn test_assign_updates_nearest_declaration() {
        let mut frames = Frames::new();
        frames.declare("x", Value::Float(1.0));
        frames.enter();
        frames.assign("x", Value::Float(9.0));
        assert!(frames.leave());
        assert_eq!(frames.get("x"), Value::Float(9.0));
    }

    #[test]
    fn test_assign_without_declaration_is_a_no_op() {
        let mut frames = Frames::new();
        frames.assign("ghost", Value::Float(1.0));
        assert_eq!(frames.get("ghost"), Value::Nil);
    }

    #[test]
    fn test_cannot_leave_root() {
        let mut frames = Frames::new();
        assert!(!frames.leave());
    }

    #[test]
    fn test_framed_ancestor_skips_block_scopes() {
        let mut frames = Frames::new();
        assert_eq!(frames.framed_ancestor(), None);
        frames.enter_framed(3, 9);
        let framed = frames.current();
        frames.enter();
        frames.enter();
        assert_eq!(frames.framed_ancestor(), Some(framed));
        assert_eq!(frames.frame(framed).end, Some(9));
    }

    #[test]
    fn test_anchored_ancestor_and_unwind() {
        let mut frames = Frames::new();
        frames.enter();
        frames.set_anchor(true);
        let anchor = frames.current();
        frames.enter();
        frames.enter();
        assert_eq!(frames.anchored_ancestor(), Some(anchor));
        frames.unwind_to(anchor);
        assert_eq!(frames.current(), anchor);
        frames.set_anchor(false);
        assert_eq!(frames.anchored_ancestor(), None);
    }

    #[test]
    fn test_unwind_past_discards_nested_scopes() {
        let mut frames = Frames::new();
        frames.enter_framed(0, 5);
        let framed = frames.current();
        frames.enter();
        frames.enter();
        assert!(frames.unwind_past(framed));
        assert!(frames.is_root());
    }
}
