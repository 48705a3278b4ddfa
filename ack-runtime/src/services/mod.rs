//! Sample services built on the runtime.

pub mod bookstore;
pub mod elasticache;
