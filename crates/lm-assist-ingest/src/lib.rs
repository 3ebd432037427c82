mod parser;
mod reader;
mod schema;

pub use parser::*;
pub use reader::*;
pub use schema::*;
