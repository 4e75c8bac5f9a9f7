//! The owning effect, seen through the narrow interface the cache needs:
//! an abort flag consulted between tile tasks, and a script name for trace
//! output.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait RenderEffect: Send + Sync {
    fn is_render_aborted(&self) -> bool;
    fn script_name(&self) -> &str;
}

/// Standalone effect handle backed by an atomic flag.
#[derive(Debug, Default)]
pub struct RenderFlag {
    name: String,
    aborted: AtomicBool,
}

impl RenderFlag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), aborted: AtomicBool::new(false) }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

impl RenderEffect for RenderFlag {
    fn is_render_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn script_name(&self) -> &str {
        &self.name
    }
}
