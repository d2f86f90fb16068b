pub mod config;
pub mod distributed;
pub mod moe;
