#![allow(clippy::test_attr_in_doctest)]
#![doc = include_str!("../README.md")]

mod alloc;
mod config;
mod display;
mod error;
mod export;
mod frame;
mod gate;
mod query;
mod reentry;
mod sampler;
mod store;
mod tree;

pub use alloc::*;
pub use config::*;
pub use display::*;
pub use error::*;
pub use export::*;
pub use frame::*;
pub use gate::*;
pub use query::*;
pub use sampler::*;
pub use store::*;
pub use tree::*;
