//! Provider clients implementing [`ClientWrapper`](crate::client_wrapper::ClientWrapper).

pub mod common;
pub mod http_pool;
pub mod openai;
