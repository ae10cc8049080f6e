pub mod signal;
pub mod subscription;
pub mod trade;
pub mod user;
