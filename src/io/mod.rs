pub mod ocr;
pub mod pdf;

pub use ocr::*;
pub use pdf::*;
