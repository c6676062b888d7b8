pub mod proxy;
pub mod requests;

pub use proxy::*;
pub use requests::*;
