mod error;
pub use error::{AnyError, AnyResult, Error, Result};

pub mod asset;
pub mod config;
pub mod domain;
pub mod matcher;
pub mod naming;
pub mod util;
pub mod vm;
