//! Core graph model: arena-backed whole-program CFG.
//!
//! Blocks, functions and string xrefs live in per-CFG arenas and refer to
//! each other through dense integer ids. This avoids reference cycles
//! (block ↔ block, function ↔ block ↔ function) and lets the transformer
//! mutate the graph while iterating over snapshot id vectors.

mod block;
mod cfg;
mod function;
mod ids;
mod xref;

pub use block::BasicBlock;
pub use cfg::{AddrToBlockLookup, Cfg, VIRTUAL_EXIT};
pub use function::FuncNode;
pub use ids::{BlockId, FuncId, XrefId};
pub use xref::StringXref;
