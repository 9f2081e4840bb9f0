pub mod config;
pub mod desync;
pub mod packets;
pub mod proxy;

pub use config::*;
pub use desync::*;
pub use packets::*;
pub use proxy::*;
