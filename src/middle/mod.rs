//! Types are resolved here and the AST is turned into IR. The IR is then
//! optimized in place before the backend lowers it to bytecode.

pub mod ir;
pub mod optimization;
pub mod ty;
