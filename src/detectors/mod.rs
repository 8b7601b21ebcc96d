pub mod ast;
pub mod smells;
