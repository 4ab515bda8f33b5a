pub mod authenticate;
pub mod config;
pub mod session;

pub use authenticate::*;
pub use config::*;
pub use session::*;
