//! Delivery planning for fetched media.
//!
//! Turns extractor metadata into delivery plans whose byte size is proven
//! before anything is downloaded. Unknown size means refusal.

pub mod schema;
pub mod size;
pub mod plan;
pub mod text;

pub use schema::*;
pub use size::*;
pub use plan::*;
pub use text::*;
