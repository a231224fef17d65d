pub mod parse;
pub mod reconstruct;
pub mod server;
pub mod tls;

pub use reconstruct::Reconstructor;
