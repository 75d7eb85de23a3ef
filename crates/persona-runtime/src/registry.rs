//! [`BackendRegistry`] – candidate models and their availability.
//!
//! A registry is built fresh for every invocation sequence from the static
//! model list.  Priority is list position.  A backend that fails is marked
//! unavailable for the rest of that sequence and never re-enabled; the next
//! request starts from a clean registry again.
//!
//! # Example
//!
//! ```rust
//! use persona_runtime::registry::BackendRegistry;
//!
//! let mut registry = BackendRegistry::new(["a", "b", "a"]);
//! assert_eq!(registry.len(), 2);
//! assert_eq!(registry.next_available().unwrap().name, "a");
//!
//! registry.mark_unavailable("a");
//! assert_eq!(registry.next_available().unwrap().name, "b");
//!
//! registry.mark_unavailable("b");
//! assert!(registry.next_available().is_none());
//! ```

use tracing::debug;

/// One candidate inference backend (a model id on the configured service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    /// Position in the configured list; lower is tried first.
    pub priority: usize,
    pub available: bool,
}

/// Ordered backends with per-backend availability.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
}

impl BackendRegistry {
    /// Build a registry from an ordered list of backend names.
    ///
    /// Blank names are skipped and duplicates collapse to their first
    /// occurrence.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut backends: Vec<Backend> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || backends.iter().any(|b| b.name == name) {
                continue;
            }
            backends.push(Backend {
                name: name.to_string(),
                priority: backends.len(),
                available: true,
            });
        }
        Self { backends }
    }

    /// The highest-priority backend still available.
    pub fn next_available(&self) -> Option<&Backend> {
        self.backends.iter().find(|b| b.available)
    }

    /// Take `name` out of rotation for the rest of this sequence.
    ///
    /// Returns `false` when no backend has that name.
    pub fn mark_unavailable(&mut self, name: &str) -> bool {
        match self.backends.iter_mut().find(|b| b.name == name) {
            Some(backend) => {
                if backend.available {
                    debug!(backend = name, "backend marked unavailable");
                }
                backend.available = false;
                true
            }
            None => false,
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.backends.iter().filter(|b| b.available).count()
    }
}
