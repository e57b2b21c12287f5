//! Marker protocol: parsing generator output and merging it into primary text.
//!
//! 1. [`parse`] turns raw secondary output into an [`InstructionSet`]
//! 2. [`merge`] splices that set into primary text to produce rendered text

pub mod merge;
pub mod model;
pub mod parser;

pub use merge::{merge, split_paragraphs};
pub use model::{Insert, InstructionSet};
pub use parser::parse;
