pub mod executor;
pub mod inspector;
pub mod pool;
