pub mod client;

pub use client::{Row, Store};
