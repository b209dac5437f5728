pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod util;
pub mod wire;
pub mod test_util;
