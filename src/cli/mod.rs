pub mod login;
pub mod resolve;
pub mod store;
