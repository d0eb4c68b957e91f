//! Driver registry.
//!
//! A process-wide name → factory map, populated with the builtin drivers on
//! first use. Registering the same name twice is a programming error and
//! panics. Tests that need isolation can build their own [`Registry`]
//! instead of touching the global one.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, LazyLock, RwLock};

use futures::future::BoxFuture;

use crate::config::Config;
use crate::engine::StorageEngine;

pub type EngineFuture = BoxFuture<'static, io::Result<Arc<dyn StorageEngine>>>;
pub type DriverFactory = Arc<dyn Fn(&Config) -> EngineFuture + Send + Sync>;

/// An explicit driver registry.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl Registry {
    /// An empty registry with no drivers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a driver available under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&Config) -> EngineFuture + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap();
        if factories.contains_key(name) {
            panic!("shardfs: driver {name:?} already registered");
        }
        factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Sorted list of registered driver names.
    pub fn drivers(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap();
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct an engine from the driver named by `config.driver`.
    pub async fn open(&self, config: &Config) -> io::Result<Arc<dyn StorageEngine>> {
        let factory = {
            let factories = self.factories.read().unwrap();
            factories.get(&config.driver).cloned()
        };
        match factory {
            Some(factory) => factory(config).await,
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown storage driver {:?}", config.driver),
            )),
        }
    }
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new();
    crate::driver::register_builtin(&registry);
    registry
});

/// The process-wide registry, with the builtin drivers already present.
pub fn global() -> &'static Registry {
    &GLOBAL
}

/// Register a driver in the global registry. Panics on a duplicate name.
pub fn register<F>(name: &str, factory: F)
where
    F: Fn(&Config) -> EngineFuture + Send + Sync + 'static,
{
    global().register(name, factory);
}

/// Sorted names of all globally registered drivers.
pub fn drivers() -> Vec<String> {
    global().drivers()
}

/// Open an engine through the global registry.
pub async fn open(config: &Config) -> io::Result<Arc<dyn StorageEngine>> {
    global().open(config).await
}
