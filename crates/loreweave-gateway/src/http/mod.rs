pub mod chat;
pub mod debug;
pub mod health;
pub mod history;
pub mod sessions;
