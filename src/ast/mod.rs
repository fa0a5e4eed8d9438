/// SQL AST shared by the planner and the memory engine.
///
/// ```text
/// Pipeline prefix ──► planner ──► AST (types.rs) ──► compiler.rs ──► SQL + params
///                                      ▲
/// SQL text (memory engine) ──► parser.rs
/// ```
pub mod compiler;
pub mod parser;
pub mod types;

pub use compiler::compile;
pub use parser::{parse_single, parse_sql};
pub use types::*;
