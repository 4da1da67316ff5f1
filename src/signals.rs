//! Lifecycle observers.
//!
//! Observers are handed to the registry builder explicitly; there is no
//! process-wide signal namespace.

use crate::config::{BindConfig, SessionOptions};
use crate::db::pool::{Engine, ExecutionOptions};
use std::fmt;
use std::sync::Arc;

/// Hooks fired around bind lifecycle events. All default to doing nothing.
#[allow(unused_variables)]
pub trait BindObserver: Send + Sync {
    fn before_engine_created(&self, bind: &str, config: &BindConfig) {}

    fn after_engine_created(&self, bind: &str, config: &BindConfig, engine: &Engine) {}

    fn before_session_factory_created(&self, bind: &str, options: &SessionOptions) {}

    fn after_session_factory_created(&self, bind: &str, options: &SessionOptions) {}

    fn bind_context_entered(&self, bind: &str, options: &ExecutionOptions, engine: &Engine) {}

    fn bind_context_exited(&self, bind: &str, options: &ExecutionOptions, failed: bool) {}

    fn before_framework_init(&self, binds: &[String]) {}

    fn after_framework_init(&self, binds: &[String]) {}

    /// `sets` are the fixture set names that were loaded.
    fn fixtures_loaded(&self, sets: &[String], rows: usize) {}
}

/// Ordered list of observers.
#[derive(Clone, Default)]
pub struct Signals(Vec<Arc<dyn BindObserver>>);

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signals").field(&self.0.len()).finish()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn BindObserver>) {
        self.0.push(observer);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Call `f` on every observer in registration order.
    pub fn emit(&self, f: impl Fn(&dyn BindObserver)) {
        for observer in &self.0 {
            f(observer.as_ref());
        }
    }
}
