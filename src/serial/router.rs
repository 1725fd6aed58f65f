//! Dispatch of firmware lines that no instruction claimed.
//!
//! Observers register a pattern and a handler. Every routed line is tested
//! against every pattern in registration order and all matching handlers
//! run. Keeping patterns mutually exclusive is the registrant's job.

use super::instruction::LineMatch;
use regex::Regex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = dyn Fn(&LineMatch) -> HandlerResult + Send + Sync;

struct Route {
    pattern: Regex,
    handler: Box<Handler>,
}

#[derive(Default)]
pub struct OutputRouter {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, pattern: Regex, handler: F)
    where
        F: Fn(&LineMatch) -> HandlerResult + Send + Sync + 'static,
    {
        tracing::debug!("Registering output handler for /{}/", pattern.as_str());
        let route = Arc::new(Route {
            pattern,
            handler: Box::new(handler),
        });
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler whose pattern matches `line` and returns how many
    /// matched. A handler that errors or panics is logged and skipped.
    pub fn dispatch(&self, line: &str) -> usize {
        // Handlers run against a snapshot so they may register further routes.
        let routes: Vec<Arc<Route>> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut matched = 0;
        for route in routes.iter() {
            let Some(found) = LineMatch::find(&route.pattern, line) else {
                continue;
            };
            matched += 1;
            match catch_unwind(AssertUnwindSafe(|| (route.handler)(&found))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Output handler /{}/ failed on '{}': {}", route.pattern.as_str(), line, e);
                }
                Err(_) => {
                    tracing::error!("Output handler /{}/ panicked on '{}'", route.pattern.as_str(), line);
                }
            }
        }

        if matched == 0 {
            tracing::debug!("Unexpected response: {}", line);
        }
        matched
    }
}

impl std::fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRouter")
            .field("routes", &self.len())
            .finish()
    }
}
