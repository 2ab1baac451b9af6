pub mod cipher;
pub mod identity;
pub mod key_store;
