//! Target names, references and declarations.

pub mod name;
mod types;

pub use name::*;
pub use types::*;
