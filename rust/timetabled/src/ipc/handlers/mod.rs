pub mod catalog;
pub mod core;
pub mod locks;
pub mod session;
pub mod setup;
pub mod term;
