//! Dense arena ids.
//!
//! Ids are assigned in ascending address order at load time, so the natural
//! `Ord` on an id agrees with address order and every `BTreeSet<Id>`
//! iteration is deterministic.

/// Id of a function in the CFG's function arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);

/// Id of a basic block in the CFG's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

/// Id of a string xref in the CFG's xref arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct XrefId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl XrefId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
