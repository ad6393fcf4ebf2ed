pub mod keys;
pub mod metadata;
pub mod object;

pub use metadata::*;
pub use object::*;
