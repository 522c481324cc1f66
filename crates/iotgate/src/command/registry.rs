//! Command Registry
//!
//! Maps command names to handler factories. Read by the router on every
//! request and written by the plugin loader at runtime; the last `add` for
//! a name wins.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{Command, Request};
use crate::store::{DeviceStore, MemoryStore};

/// Shared services handed to every factory
#[derive(Clone)]
pub struct Dependencies {
    pub store: Arc<dyn DeviceStore>,
}

impl Dependencies {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }
}

/// Builds a handler for one request
pub type CommandFactory = Arc<dyn Fn(Request, &Dependencies) -> Box<dyn Command> + Send + Sync>;

/// Concurrent name → factory map
pub struct CommandRegistry {
    factories: DashMap<String, CommandFactory>,
    dependencies: Dependencies,
}

impl CommandRegistry {
    pub fn new(dependencies: Dependencies) -> Self {
        Self {
            factories: DashMap::new(),
            dependencies,
        }
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }

    /// Register `factory` under `name`, replacing any previous entry
    pub fn add<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(Request, &Dependencies) -> Box<dyn Command> + Send + Sync + 'static,
    {
        self.add_factory(name, Arc::new(factory));
    }

    pub fn add_factory(&self, name: impl Into<String>, factory: CommandFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            debug!("Replaced command '{}'", name);
        } else {
            debug!("Registered command '{}'", name);
        }
    }

    /// Build the handler registered for `name`, or `None` if there is none
    pub fn create(&self, name: &str, request: Request) -> Option<Box<dyn Command>> {
        // Release the shard lock before running the factory
        let factory = self.factories.get(name).map(|entry| Arc::clone(entry.value()))?;
        Some(factory(request, &self.dependencies))
    }

    pub fn remove(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(Dependencies::default())
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, Envelope, Response};
    use crate::net::testing::captured;
    use serde_json::{Map, Value, json};

    struct Echo {
        tag: &'static str,
        data: Map<String, Value>,
    }

    impl Command for Echo {
        fn execute(self: Box<Self>) -> Result<Response, CommandError> {
            Ok(Response::success(self.tag, "echo").with("data", Value::Object(self.data)))
        }
    }

    fn request(command: &str, data: Value) -> Request {
        let (conn, _captured) = captured();
        let data = data.as_object().cloned().unwrap_or_default();
        Request::new(conn, Envelope::new(command, data))
    }

    #[test]
    fn test_create_passes_request_to_factory() {
        let registry = CommandRegistry::default();
        registry.add("Register Product", |request: Request, _: &Dependencies| {
            Box::new(Echo {
                tag: "first",
                data: request.data().clone(),
            }) as Box<dyn Command>
        });

        let data = json!({"company_id": "42", "product_name": "watch"});
        let command = registry
            .create("Register Product", request("Register Product", data.clone()))
            .unwrap();
        let response = command.execute().unwrap();
        assert_eq!(response.extra["data"], data);
    }

    #[test]
    fn test_unknown_name_returns_none() {
        let registry = CommandRegistry::default();
        assert!(registry.create("Nope", request("Nope", json!({}))).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_last_add_wins() {
        let registry = CommandRegistry::default();
        for tag in ["first", "second"] {
            registry.add("Ping", move |request: Request, _: &Dependencies| {
                Box::new(Echo {
                    tag,
                    data: request.data().clone(),
                }) as Box<dyn Command>
            });
        }

        assert_eq!(registry.len(), 1);
        let response = registry
            .create("Ping", request("Ping", json!({})))
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(response.command.as_deref(), Some("second"));

        assert!(registry.remove("Ping"));
        assert!(!registry.contains("Ping"));
    }

    #[test]
    fn test_names_sorted() {
        let registry = CommandRegistry::default();
        for name in ["b", "c", "a"] {
            registry.add(name, |request: Request, _: &Dependencies| {
                Box::new(Echo {
                    tag: "x",
                    data: request.data().clone(),
                }) as Box<dyn Command>
            });
        }
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }
    #[test]
    fn test_lookups_during_concurrent_add_and_remove() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        fn echo(request: Request, _: &Dependencies) -> Box<dyn Command> {
            Box::new(Echo {
                tag: "echo",
                data: request.data().clone(),
            })
        }

        let registry = Arc::new(CommandRegistry::default());
        registry.add("Stable", echo);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    registry.add("Flaky", echo);
                    registry.remove("Flaky");
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let stable = registry.create("Stable", request("Stable", json!({})));
                        assert!(stable.is_some());
                        if let Some(flaky) = registry.create("Flaky", request("Flaky", json!({}))) {
                            assert!(flaky.execute().is_ok());
                        }
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert_eq!(registry.names(), vec!["Stable"]);
    }
}
