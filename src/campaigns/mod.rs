pub mod executor;
pub mod logs;
pub mod queue;
pub mod types;

pub use executor::*;
pub use logs::*;
pub use queue::*;
pub use types::*;
