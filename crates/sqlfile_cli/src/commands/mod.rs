//! CLI command implementations.

pub mod hold;
pub mod inspect;
pub mod probe;
pub mod replace;
pub mod truncate;
