//! URI-keyed callback registry with lifetime-safe dispatch
//!
//! One registry exists per protocol; a registered servlet maps a URI to a
//! callback plus an optional dependency, typically the module that installed
//! it. The registry stores only weak references: returning the strong
//! [`Servlet`] handle to the caller ties the servlet's lifetime to the caller
//! rather than to the map, so unloading a module makes its servlets
//! unresolvable without any explicit deregistration, and without the registry
//! ever extending their lifetime.
//!
//! Lookup treats an expired entry as absent but leaves it in place; the slot
//! is reclaimed opportunistically by the next registration for that URI or by
//! [`clear`](ServletRegistry::clear).
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use poseidon::servlet::{ServletCallback, ServletRegistry};
//!
//! let registry: ServletRegistry<ServletCallback> = ServletRegistry::new();
//! let callback: ServletCallback = Arc::new(|session, data| {
//!     session.send(poseidon::buffer::StreamBuffer::from(data));
//! });
//! let handle = registry.register("/echo", None, callback).unwrap();
//!
//! assert!(registry.get("/echo").is_some());
//! drop(handle);
//! assert!(registry.get("/echo").is_none());
//! ```

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::error::Error;
use crate::session::TcpSession;

/// Weak reference to the module a servlet belongs to
pub type Dependency = Weak<dyn Any + Send + Sync>;

/// Strong form of [`Dependency`], held for the duration of a dispatch
pub type LockedDependency = Arc<dyn Any + Send + Sync>;

/// Request callback shape shared by the HTTP, WebSocket and Player registries
///
/// The wire protocol parser (external to this crate) resolves the servlet and
/// invokes the callback with the session and the request payload.
pub type ServletCallback = Arc<dyn Fn(&Arc<TcpSession>, &[u8]) + Send + Sync>;

/// Registry for HTTP request servlets
pub type HttpServletRegistry = ServletRegistry<ServletCallback>;
/// Registry for WebSocket message servlets
pub type WebSocketServletRegistry = ServletRegistry<ServletCallback>;
/// Registry for Player protocol servlets
pub type PlayerServletRegistry = ServletRegistry<ServletCallback>;

/// A registered URI handler
///
/// The `Arc<Servlet>` returned by [`ServletRegistry::register`] is the
/// servlet's lifetime: drop it and lookups for the URI start returning
/// `None`.
pub struct Servlet<C> {
    uri: String,
    dependency: Option<Dependency>,
    callback: C,
}

impl<C> Servlet<C> {
    /// URI this servlet was registered under
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The registered callback
    pub fn callback(&self) -> &C {
        &self.callback
    }
}

impl<C> std::fmt::Debug for Servlet<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servlet").field("uri", &self.uri).finish()
    }
}

impl<C> Drop for Servlet<C> {
    fn drop(&mut self) {
        log::info!("destroyed servlet for URI {}", self.uri);
    }
}

/// URI to weak-servlet map guarded by a reader-writer lock
///
/// Registration takes the exclusive lock; lookup takes the shared lock.
pub struct ServletRegistry<C> {
    servlets: RwLock<HashMap<String, Weak<Servlet<C>>>>,
}

impl<C> Default for ServletRegistry<C> {
    fn default() -> Self {
        Self {
            servlets: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> std::fmt::Debug for ServletRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServletRegistry").finish_non_exhaustive()
    }
}

impl<C> ServletRegistry<C> {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a servlet for `uri`
    ///
    /// Fails with [`Error::DuplicateServlet`] while a previously returned
    /// handle for the same URI is still alive. An expired entry is displaced
    /// silently.
    pub fn register(
        &self,
        uri: impl Into<String>,
        dependency: Option<Dependency>,
        callback: C,
    ) -> crate::Result<Arc<Servlet<C>>> {
        let uri = uri.into();
        log::info!("created servlet for URI {uri}");
        let servlet = Arc::new(Servlet {
            uri,
            dependency,
            callback,
        });
        {
            let mut servlets = self.servlets.write().unwrap();
            match servlets.entry(servlet.uri.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().upgrade().is_some() {
                        return Err(Error::DuplicateServlet(servlet.uri.clone()));
                    }
                    entry.insert(Arc::downgrade(&servlet));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::downgrade(&servlet));
                }
            }
        }
        Ok(servlet)
    }

    /// Resolves `uri` to its servlet for one dispatch
    ///
    /// Returns `None` when no entry exists, the servlet handle has been
    /// dropped, or the servlet's dependency can no longer be upgraded. On
    /// success the upgraded dependency is returned alongside the servlet to
    /// keep the owning module alive for the duration of the dispatch.
    pub fn get(&self, uri: &str) -> Option<(Arc<Servlet<C>>, Option<LockedDependency>)> {
        let servlets = self.servlets.read().unwrap();
        let servlet = servlets.get(uri)?.upgrade()?;
        let locked = match &servlet.dependency {
            Some(dependency) => Some(dependency.upgrade()?),
            None => None,
        };
        Some((servlet, locked))
    }

    /// Drops every map entry
    ///
    /// Live handles held by callers are unaffected, but their URIs resolve to
    /// `None` afterwards.
    pub fn clear(&self) {
        log::info!("unloading all servlets...");
        self.servlets.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Counter = Arc<AtomicUsize>;

    fn counting_registry() -> ServletRegistry<Counter> {
        ServletRegistry::new()
    }

    #[test]
    fn test_register_then_get_returns_same_callback() {
        let registry = counting_registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let _handle = registry.register("/x", None, Arc::clone(&hits)).unwrap();

        let (servlet, locked) = registry.get("/x").unwrap();
        assert!(locked.is_none());
        servlet.callback().fetch_add(1, Ordering::SeqCst);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_fails_while_handle_lives() {
        let registry = counting_registry();
        let handle = registry
            .register("/x", None, Arc::new(AtomicUsize::new(0)))
            .unwrap();

        let err = registry
            .register("/x", None, Arc::new(AtomicUsize::new(0)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateServlet(uri) if uri == "/x"));

        drop(handle);
        assert!(registry
            .register("/x", None, Arc::new(AtomicUsize::new(0)))
            .is_ok());
    }

    #[test]
    fn test_dropped_handle_makes_uri_unresolvable() {
        let registry = counting_registry();
        let handle = registry
            .register("/gone", None, Arc::new(AtomicUsize::new(0)))
            .unwrap();
        assert!(registry.get("/gone").is_some());
        drop(handle);
        assert!(registry.get("/gone").is_none());
    }

    #[test]
    fn test_expired_dependency_hides_servlet_without_removing_entry() {
        let registry = counting_registry();
        let module: Arc<dyn Any + Send + Sync> = Arc::new("module");
        let _handle = registry
            .register(
                "/plugin",
                Some(Arc::downgrade(&module)),
                Arc::new(AtomicUsize::new(0)),
            )
            .unwrap();

        assert!(registry.get("/plugin").is_some());
        drop(module);
        // The handle is still alive, yet lookup must treat the servlet as gone.
        assert!(registry.get("/plugin").is_none());
    }

    #[test]
    fn test_dependency_is_locked_for_dispatch() {
        let registry = counting_registry();
        let module: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let _handle = registry
            .register(
                "/plugin",
                Some(Arc::downgrade(&module)),
                Arc::new(AtomicUsize::new(0)),
            )
            .unwrap();

        let (_servlet, locked) = registry.get("/plugin").unwrap();
        let locked = locked.unwrap();
        assert_eq!(locked.downcast_ref::<u32>(), Some(&42));
        assert_eq!(Arc::strong_count(&module), 2);
    }

    #[test]
    fn test_clear_forgets_entries() {
        let registry = counting_registry();
        let _handle = registry
            .register("/x", None, Arc::new(AtomicUsize::new(0)))
            .unwrap();
        registry.clear();
        assert!(registry.get("/x").is_none());
    }
}
