pub mod e2b;
pub mod local;
pub mod modal;
