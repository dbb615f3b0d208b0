pub mod client;
pub mod codec;
pub mod hub;
pub mod manager;
pub mod pumps;
