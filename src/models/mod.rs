pub mod filter;
pub mod proxy;

pub use filter::*;
pub use proxy::*;
