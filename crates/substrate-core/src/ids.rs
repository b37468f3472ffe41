//! Arena-style identifiers.
//!
//! Nodes, edges and entities refer to one another only through these ids,
//! never through references, so the node ↔ entity cycle carries no ownership.

use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(NodeId, "n");
arena_id!(EdgeId, "e");
arena_id!(EntityId, "x");

/// Monotonic id source for one tenant partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn next_raw(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Make sure ids handed out later never collide with `seen`.
    pub fn observe(&mut self, seen: u64) {
        if seen >= self.next {
            self.next = seen + 1;
        }
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        assert_eq!(NodeId(3).to_string(), "n3");
        assert_eq!(EdgeId(7).to_string(), "e7");
        assert_eq!(EntityId(1).to_string(), "x1");
    }

    #[test]
    fn test_allocator_observe_skips_seen() {
        let mut alloc = IdAllocator::default();
        assert_eq!(alloc.next_raw(), 0);
        alloc.observe(10);
        assert_eq!(alloc.next_raw(), 11);
        alloc.observe(4);
        assert_eq!(alloc.next_raw(), 12);
    }

    #[test]
    fn test_serde_transparent() {
        let json = serde_json::to_string(&NodeId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
