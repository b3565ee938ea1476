pub mod inject;
pub mod tokens;

pub use inject::*;
pub use tokens::*;
