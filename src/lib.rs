pub mod compiler;
pub mod dsl;
pub mod handlers;
pub mod nodes;
pub mod runtime;
