pub mod buffer;
pub mod error;
pub mod gateway;
pub mod layout;
pub mod peer;

mod define;
pub use define::*;
