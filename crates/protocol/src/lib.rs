pub mod config;
pub mod envelope;
pub mod fragment;
pub mod input;
pub mod transfer;

pub use config::*;
pub use envelope::*;
pub use fragment::*;
pub use input::*;
pub use transfer::*;
