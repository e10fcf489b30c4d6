//! Application registry and request-dispatch tree.
//!
//! # Responsibilities
//! - Collect routes (method, path, handler) and remember them for the route table
//! - Hold on-listen and on-fork hooks
//! - Build the Axum router once, under a lock, before any connection is accepted

use std::sync::{Mutex, PoisonError};

use axum::handler::Handler;
use axum::http::Method;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::BoxError;

type ListenHook = Box<dyn Fn() -> Result<(), BoxError> + Send + Sync>;
type ForkHook = Box<dyn Fn(u32) + Send + Sync>;

/// Read-only view of a registered route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
    /// Type name of the handler.
    pub handler: String,
}

struct RouteEntry {
    info: RouteInfo,
    router: MethodRouter,
}

/// An application: routes plus the hooks that run around startup.
pub struct App {
    name: Option<String>,
    routes: Vec<RouteEntry>,
    listen_hooks: Vec<ListenHook>,
    fork_hooks: Vec<ForkHook>,
    tree: Mutex<Option<Router>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            name: None,
            routes: Vec::new(),
            listen_hooks: Vec::new(),
            fork_hooks: Vec::new(),
            tree: Mutex::new(None),
        }
    }

    /// Name shown in the startup banner.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn app_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Register `handler` for `method` on `path`.
    ///
    /// Registering the same method and path twice replaces the earlier handler.
    ///
    /// # Panics
    ///
    /// Panics if `path` does not start with `/`, like [`Router::route`].
    pub fn route<H, T>(mut self, method: Method, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        assert!(path.starts_with('/'), "Paths must start with a `/`, got {path:?}");

        let filter = match MethodFilter::try_from(method.clone()) {
            Ok(filter) => filter,
            Err(_) => {
                tracing::warn!(method = %method, path, "Unsupported method, route ignored");
                return self;
            }
        };

        let info = RouteInfo {
            method,
            path: path.to_string(),
            handler: std::any::type_name::<H>().to_string(),
        };
        let entry = RouteEntry {
            info,
            router: on(filter, handler),
        };

        match self
            .routes
            .iter_mut()
            .find(|e| e.info.method == entry.info.method && e.info.path == entry.info.path)
        {
            Some(existing) => *existing = entry,
            None => self.routes.push(entry),
        }
        self
    }

    pub fn get<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::POST, path, handler)
    }

    pub fn put<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::PUT, path, handler)
    }

    pub fn delete<H, T>(self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::DELETE, path, handler)
    }

    /// Run `hook` right before serving. Hooks run in registration order and
    /// the first error aborts startup.
    pub fn on_listen<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.listen_hooks.push(Box::new(hook));
        self
    }

    /// Run `hook` with the pid of every spawned prefork child.
    pub fn on_fork<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.fork_hooks.push(Box::new(hook));
        self
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(|e| e.info.clone()).collect()
    }

    pub fn handlers_count(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn run_listen_hooks(&self) -> Result<(), BoxError> {
        for (index, hook) in self.listen_hooks.iter().enumerate() {
            hook().inspect_err(|e| {
                tracing::error!(hook = index, error = %e, "On-listen hook failed");
            })?;
        }
        Ok(())
    }

    pub(crate) fn run_fork_hooks(&self, pid: u32) {
        for hook in &self.fork_hooks {
            hook(pid);
        }
    }

    /// Build (or reuse) the dispatch tree.
    ///
    /// The lock makes concurrent callers wait for one complete build.
    pub fn build_tree(&self) -> Router {
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(router) = tree.as_ref() {
            return router.clone();
        }

        let mut by_path: Vec<(&str, MethodRouter)> = Vec::new();
        for entry in &self.routes {
            match by_path.iter_mut().find(|(path, _)| *path == entry.info.path) {
                Some((_, merged)) => *merged = merged.clone().merge(entry.router.clone()),
                None => by_path.push((&entry.info.path, entry.router.clone())),
            }
        }

        let router = by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(path, method_router)
            })
            .layer(TraceLayer::new_for_http());

        tracing::debug!(handlers = self.routes.len(), "Dispatch tree built");
        *tree = Some(router.clone());
        router
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("routes", &self.routes.len())
            .field("listen_hooks", &self.listen_hooks.len())
            .field("fork_hooks", &self.fork_hooks.len())
            .finish()
    }
}
