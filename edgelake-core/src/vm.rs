//! Execution engine seam.
//!
//! An [`Engine`] turns a deployment context into a [`Runtime`]: one isolated
//! instance ready to load modules and run an entry point for a single event.
use std::fmt;

use futures_util::future::LocalBoxFuture;

use crate::{util::div_ceil_with_limit, AnyResult};

pub const MEMORY_PAGE_SIZE: u64 = 64 * 1024;
/// 4 GiB addressable by a 32-bit module.
pub const MEMORY_LIMIT_PAGES: u64 = 65_536;

/// Identity of the deployment an instance runs for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmContext {
    pub project: String,
    pub application: String,
    pub resource: String,
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub memory_limit_pages: u32,
}

impl VmConfig {
    pub fn with_memory(bytes: u64) -> Self {
        let pages = div_ceil_with_limit(bytes, MEMORY_PAGE_SIZE, MEMORY_LIMIT_PAGES);
        Self {
            memory_limit_pages: pages as u32,
        }
    }
}

/// Host capability linked into every runtime.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

pub trait Engine: Send + Sync {
    fn instantiate<'a>(
        &'a self,
        ctx: &'a VmContext,
        config: VmConfig,
    ) -> LocalBoxFuture<'a, AnyResult<Box<dyn Runtime>>>;
}

pub trait Runtime: Send {
    fn attach(&mut self, plugin: &dyn Plugin) -> AnyResult<()>;

    /// Loads `module` and reports whether it exports `entry`.
    fn lookup(&mut self, module: &str, entry: &str) -> AnyResult<bool>;

    /// Runs `entry` of `module` with the event id, returning its exit code.
    fn call<'a>(
        &'a mut self,
        module: &'a str,
        entry: &'a str,
        event: u32,
    ) -> LocalBoxFuture<'a, AnyResult<u32>>;

    /// Linear memory size of `module` in bytes, if loaded.
    fn memory_size(&self, module: &str) -> Option<u64>;

    fn close(&mut self) {}
}

impl fmt::Debug for dyn Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Runtime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pages() {
        assert_eq!(VmConfig::with_memory(16 * 1024 * 1024).memory_limit_pages, 256);
        assert_eq!(VmConfig::with_memory(1).memory_limit_pages, 1);
        assert_eq!(
            VmConfig::with_memory(u64::MAX).memory_limit_pages as u64,
            MEMORY_LIMIT_PAGES
        );
    }
}
