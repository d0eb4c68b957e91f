//! Builtin storage drivers.
//!
//! - `local`   — pass-through onto a host directory
//! - `sharded` — content-addressed chunked storage with dedup
//! - `s3`      — remote adapter over one S3 bucket
//!
//! The memory engine is a library building block (and test double) rather
//! than a registered driver; construct it directly.

pub mod local;
pub mod memory;
pub mod s3;
pub mod sharded;

use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::StorageEngine;
use crate::registry::Registry;

/// Register the builtin drivers. The global registry calls this once from
/// its initializer; explicit registries may call it too.
pub fn register_builtin(registry: &Registry) {
    registry.register("local", |config: &Config| {
        let base_path = config.base_path.clone();
        Box::pin(async move {
            if base_path.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "local driver requires basePath",
                ));
            }
            let engine = local::LocalEngine::new(base_path).await?;
            Ok(Arc::new(engine) as Arc<dyn StorageEngine>)
        })
    });

    registry.register("sharded", |config: &Config| {
        let config = config.clone();
        Box::pin(async move { sharded::ShardedEngine::from_config(&config).await })
    });

    registry.register("s3", |config: &Config| {
        let config = config.clone();
        Box::pin(async move { s3::S3Engine::from_config(&config).await })
    });
}
