mod driver;
mod memory;
mod persist;
mod postgres;
mod query;

pub use driver::*;
pub use memory::*;
pub use persist::*;
pub use postgres::*;
pub use query::*;
