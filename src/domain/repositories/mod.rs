pub mod exchange_api;
pub mod stores;
