pub mod document;
pub mod lab;
pub mod text;

pub use document::*;
pub use lab::*;
pub use text::*;
