#![forbid(unsafe_code)]

pub mod auth;
pub mod chat_list;
pub mod group_bus;
pub mod health;
pub mod pipeline;
pub mod presence;
pub mod profile;
pub mod receipts;
pub mod session;
pub mod state;
pub mod store;
pub mod ws;
