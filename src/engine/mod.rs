pub mod crypto;
pub mod health;
pub mod key_manager;
pub mod selection;
