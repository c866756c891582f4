//! Set of module Error
pub mod buffer;
pub mod gateway;
