//! Frontend module - AST, scope resolution and type checking

pub mod ast;
pub mod overload;
pub mod resolve;
pub mod symtab;
pub mod syntax;
pub mod typeck;
