//! AST node types for mlld documents.
//!
//! Architecture: source text → (parser, out of scope) → `Node` tree →
//! `crate::interpreter::evaluator::evaluate`.

pub mod types;
