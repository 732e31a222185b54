pub mod admin;
pub mod memory;
pub mod message;
