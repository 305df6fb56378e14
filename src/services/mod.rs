pub mod consumer;
pub mod dead_letter;
pub mod error_store;
pub mod processor;
pub mod retry;
pub mod smir_client;

pub use consumer::*;
pub use dead_letter::*;
pub use error_store::*;
pub use processor::*;
pub use retry::*;
pub use smir_client::*;
