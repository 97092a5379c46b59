//! Tree builder: configuration names to a runtime layer tree.
//!
//! Layer types resolve through a registry of `type string → constructor`,
//! populated with the built-in layers at startup. External backends are
//! just more registry entries; the object-store and blockchain types are
//! recognized by the configuration but have no built-in constructor here
//! and fail construction with a clear message.
//!
//! Named layers are built memoized, so a layer referenced twice (say, one
//! `local` serving as both the data and the hash child) is instantiated
//! once and shared. The builder's in-progress set catches reference cycles
//! that survived validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::config::{IntegrityMode, LayerConfig, ServiceConfig, StackConfig};
use crate::hashing::HashAlgorithm;
use crate::layer::SharedLayer;
use crate::layers::anti_tamper::{AntiTamperLayer, TamperMode};
use crate::layers::benchmark::BenchmarkLayer;
use crate::layers::block_align::BlockAlignLayer;
use crate::layers::demux::{DemuxChild, DemuxLayer};
use crate::layers::encryption::EncryptionLayer;
use crate::layers::local::LocalLayer;
use crate::layers::read_cache::ReadCacheLayer;
use crate::layers::remote::{self, RemoteLayer};
use crate::layers::sparse::SparseCompressionLayer;
use crate::metadata::MetadataService;

/// A layer constructor: builds one layer from its config table, recursing
/// into the builder for children.
pub type Constructor =
    Box<dyn Fn(&Registry, &StackConfig, &mut BuildState, &str, &LayerConfig) -> Result<SharedLayer>>;

/// Registry of layer type names to constructors.
pub struct Registry {
    constructors: HashMap<&'static str, Constructor>,
}

impl Registry {
    /// Registry with every built-in layer type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self { constructors: HashMap::new() };
        registry.register("local", Box::new(build_local));
        registry.register("remote", Box::new(build_remote));
        registry.register("block_align", Box::new(build_block_align));
        registry.register("read_cache", Box::new(build_read_cache));
        registry.register("benchmark", Box::new(build_benchmark));
        registry.register("compression", Box::new(build_compression));
        registry.register("encryption", Box::new(build_encryption));
        registry.register("anti_tampering", Box::new(build_anti_tampering));
        registry.register("demultiplexer", Box::new(build_demultiplexer));
        registry
    }

    /// Adds or replaces a constructor for `type_name`.
    pub fn register(&mut self, type_name: &'static str, constructor: Constructor) {
        self.constructors.insert(type_name, constructor);
    }

    fn get(&self, type_name: &str) -> Option<&Constructor> {
        self.constructors.get(type_name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Memoized build progress.
#[derive(Default)]
pub struct BuildState {
    built: HashMap<String, SharedLayer>,
    building: HashSet<String>,
}

/// Builds the named layer, reusing an already-built instance if the name
/// was resolved before.
pub fn build_layer(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    name: &str,
) -> Result<SharedLayer> {
    if let Some(layer) = state.built.get(name) {
        return Ok(Arc::clone(layer));
    }
    if !state.building.insert(name.to_owned()) {
        bail!("layer reference cycle through '{name}'");
    }

    let layer_config =
        config.layers.get(name).with_context(|| format!("layer '{name}' is not defined"))?;
    let constructor = registry.get(layer_config.type_name()).with_context(|| {
        format!(
            "layer '{name}': type '{}' has no constructor in this build",
            layer_config.type_name()
        )
    })?;

    let layer = constructor(registry, config, state, name, layer_config)
        .with_context(|| format!("building layer '{name}'"))?;

    state.building.remove(name);
    state.built.insert(name.to_owned(), Arc::clone(&layer));
    Ok(layer)
}

fn build_local(
    _: &Registry,
    _: &StackConfig,
    _: &mut BuildState,
    _: &str,
    _: &LayerConfig,
) -> Result<SharedLayer> {
    Ok(Arc::new(LocalLayer::new()))
}

fn build_remote(
    _: &Registry,
    _: &StackConfig,
    _: &mut BuildState,
    _: &str,
    _: &LayerConfig,
) -> Result<SharedLayer> {
    Ok(Arc::new(RemoteLayer::connect(remote::DEFAULT_ENDPOINT)?))
}

fn build_block_align(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::BlockAlign { next, block_size } = layer else { unreachable!() };
    let child = build_layer(registry, config, state, next)?;
    Ok(Arc::new(BlockAlignLayer::new(child, *block_size)?))
}

fn build_read_cache(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::ReadCache { next, block_size, num_blocks } = layer else { unreachable!() };
    let child = build_layer(registry, config, state, next)?;
    Ok(Arc::new(ReadCacheLayer::new(child, *block_size, *num_blocks)?))
}

fn build_benchmark(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    name: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::Benchmark { next, reps } = layer else { unreachable!() };
    let child = build_layer(registry, config, state, next)?;
    Ok(Arc::new(BenchmarkLayer::new(child, name, *reps)?))
}

fn build_compression(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::Compression { next, algorithm, level, block_size, .. } = layer else {
        unreachable!()
    };
    let child = build_layer(registry, config, state, next)?;
    Ok(Arc::new(SparseCompressionLayer::new(child, *algorithm, *level, *block_size)?))
}

fn build_encryption(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::Encryption {
        next,
        block_size,
        encryption_key,
        api_key,
        vault_addr,
        secret_path,
    } = layer
    else {
        unreachable!()
    };
    let child = build_layer(registry, config, state, next)?;

    let layer = if let Some(hex_key) = encryption_key {
        let key = hex::decode(hex_key).context("encryption_key is not valid hex")?;
        EncryptionLayer::new(child, *block_size, &key)?
    } else {
        // Validation guarantees the full vault triple is present here.
        EncryptionLayer::from_vault(
            child,
            *block_size,
            vault_addr.as_deref().unwrap_or_default(),
            secret_path.as_deref().unwrap_or_default(),
            api_key.as_deref().unwrap_or_default(),
        )?
    };
    Ok(Arc::new(layer))
}

fn build_anti_tampering(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::AntiTampering {
        data_layer,
        hash_layer,
        hashes_storage,
        algorithm,
        mode,
        block_size,
    } = layer
    else {
        unreachable!()
    };
    let data = build_layer(registry, config, state, data_layer)?;
    let hashes = build_layer(registry, config, state, hash_layer)?;

    let mode = match mode {
        IntegrityMode::File => TamperMode::File,
        IntegrityMode::Block => TamperMode::Block {
            block_size: block_size.expect("validated: block mode carries block_size"),
        },
    };
    let algorithm: HashAlgorithm = *algorithm;
    Ok(Arc::new(AntiTamperLayer::new(data, hashes, hashes_storage.clone(), algorithm, mode)?))
}

fn build_demultiplexer(
    registry: &Registry,
    config: &StackConfig,
    state: &mut BuildState,
    _: &str,
    layer: &LayerConfig,
) -> Result<SharedLayer> {
    let LayerConfig::Demultiplexer {
        layers,
        passthrough_reads,
        passthrough_writes,
        enforced_layers,
    } = layer
    else {
        unreachable!()
    };

    let mut children = Vec::with_capacity(layers.len());
    for child_name in layers {
        let child = build_layer(registry, config, state, child_name)?;
        children.push(DemuxChild {
            name: child_name.clone(),
            layer: child,
            passthrough_read: passthrough_reads.contains(child_name),
            passthrough_write: passthrough_writes.contains(child_name),
            enforced: enforced_layers.contains(child_name),
        });
    }
    Ok(Arc::new(DemuxLayer::new(children)?))
}

/// A fully built stack: the root layer plus the instantiated services.
pub struct Stack {
    root: SharedLayer,
    root_name: String,
    layer_count: usize,
    metadata: Option<MetadataService>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("root_name", &self.root_name)
            .field("layer_count", &self.layer_count)
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

impl Stack {
    /// Validates `config` and instantiates the tree with the built-in
    /// registry.
    ///
    /// # Errors
    ///
    /// Any configuration or construction failure; all are fatal.
    pub fn build(config: &StackConfig) -> Result<Self> {
        Self::build_with(config, &Registry::with_builtins())
    }

    /// As [`Stack::build`], with a caller-extended registry.
    pub fn build_with(config: &StackConfig, registry: &Registry) -> Result<Self> {
        config.validate()?;

        let metadata = match &config.services {
            Some(ServiceConfig::Metadata { cache_size, threads, path }) => {
                Some(MetadataService::open(*cache_size, *threads, path.as_deref())?)
            }
            None => None,
        };

        let mut state = BuildState::default();
        let root = build_layer(registry, config, &mut state, &config.root)?;
        Ok(Self {
            root,
            root_name: config.root.clone(),
            layer_count: state.built.len(),
            metadata,
        })
    }

    /// The entry layer applications talk to.
    #[must_use]
    pub fn root(&self) -> &SharedLayer {
        &self.root
    }

    /// The metadata service, when one was configured.
    #[must_use]
    pub fn metadata(&self) -> Option<&MetadataService> {
        self.metadata.as_ref()
    }

    /// One-line description for the `check` command.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "root '{}' ({}), {} named layers, {} in tree",
            self.root_name,
            self.root.kind(),
            self.layer_count,
            self.root.descendant_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::layer::{OpContext, OpenFlags};

    #[test]
    fn test_build_minimal_stack() {
        let config = StackConfig::from_toml(
            r#"
                root = "disk"
                log_mode = "disabled"

                [layers.disk]
                type = "local"
            "#,
        )
        .unwrap();
        let stack = Stack::build(&config).unwrap();
        assert_eq!(stack.root().kind(), "local");
        assert_eq!(stack.root().descendant_count(), 1);
    }

    #[test]
    fn test_shared_child_is_built_once() {
        // Both anti-tampering children name the same local layer; the built
        // tree still counts it twice by position but resolves one instance.
        let dir = tempdir().unwrap();
        let config = StackConfig::from_toml(&format!(
            r#"
                root = "guard"
                log_mode = "disabled"

                [layers.disk]
                type = "local"

                [layers.guard]
                type = "anti_tampering"
                data_layer = "disk"
                hash_layer = "disk"
                hashes_storage = "{}"
                algorithm = "sha256"
                mode = "file"
            "#,
            dir.path().display()
        ))
        .unwrap();
        let stack = Stack::build(&config).unwrap();
        assert!(stack.summary().contains("2 named layers"));
        assert_eq!(stack.root().descendant_count(), 3);
    }

    #[test]
    fn test_end_to_end_guarded_compressed_stack() {
        let dir = tempdir().unwrap();
        let hashes = dir.path().join("hashes");
        std::fs::create_dir_all(&hashes).unwrap();

        let config = StackConfig::from_toml(&format!(
            r#"
                root = "guard"
                log_mode = "disabled"

                [layers.disk]
                type = "local"

                [layers.align]
                type = "block_align"
                next = "packed"
                block_size = 64

                [layers.packed]
                type = "compression"
                next = "disk"
                algorithm = "lz4"
                level = 0
                mode = "sparse_block"
                block_size = 64

                [layers.guard]
                type = "anti_tampering"
                data_layer = "align"
                hash_layer = "disk"
                hashes_storage = "{}"
                algorithm = "sha256"
                mode = "file"
            "#,
            hashes.display()
        ))
        .unwrap();

        let stack = Stack::build(&config).unwrap();
        let root = stack.root();
        let ctx = OpContext::none();
        let path = dir.path().join("payload.bin").to_string_lossy().into_owned();

        let fd = root.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(root.pwrite(fd, &data, 5, &ctx).unwrap(), data.len());

        let mut back = vec![0u8; data.len()];
        assert_eq!(root.pread(fd, &mut back, 5, &ctx).unwrap(), data.len());
        assert_eq!(back, data);
        root.close(fd, &ctx).unwrap();

        // Reopen cleanly; the file-mode digest was written on close.
        let fd = root.open(&path, OpenFlags::read_only(), 0, &ctx).unwrap();
        root.close(fd, &ctx).unwrap();
    }

    #[test]
    fn test_encrypted_stack_round_trips_and_seals() {
        let dir = tempdir().unwrap();
        let key: String = "0123456789abcdef".repeat(8);

        let config = StackConfig::from_toml(&format!(
            r#"
                root = "align"
                log_mode = "disabled"

                [layers.disk]
                type = "local"

                [layers.sealed]
                type = "encryption"
                next = "disk"
                block_size = 64
                encryption_key = "{key}"

                [layers.align]
                type = "block_align"
                next = "sealed"
                block_size = 64
            "#
        ))
        .unwrap();
        let stack = Stack::build(&config).unwrap();
        let root = stack.root();
        let ctx = OpContext::none();
        let path = dir.path().join("sealed.bin").to_string_lossy().into_owned();

        let fd = root.open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        let data: Vec<u8> = (0..192u32).map(|i| (i % 101) as u8).collect();
        assert_eq!(root.pwrite(fd, &data, 0, &ctx).unwrap(), data.len());

        let mut back = vec![0u8; data.len()];
        assert_eq!(root.pread(fd, &mut back, 0, &ctx).unwrap(), data.len());
        assert_eq!(back, data);
        root.close(fd, &ctx).unwrap();

        // The bytes at rest are not the plaintext.
        assert_ne!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_external_backend_types_fail_construction() {
        let config = StackConfig::from_toml(
            r#"
                root = "bucket"
                log_mode = "disabled"

                [layers.bucket]
                type = "s3_opendal"
                endpoint = "http://127.0.0.1:9000"
                access_key_id = "ak"
                secret_access_key = "sk"
                region = "us-east-1"
                bucket = "b"
                root = "/"
            "#,
        )
        .unwrap();
        let err = Stack::build(&config).unwrap_err();
        assert!(err.to_string().contains("no constructor"));
    }

    #[test]
    fn test_demultiplexer_stack_fans_out() {
        let dir = tempdir().unwrap();
        let config = StackConfig::from_toml(
            r#"
                root = "fan"
                log_mode = "disabled"

                [layers.a]
                type = "local"

                [layers.b]
                type = "local"

                [layers.fan]
                type = "demultiplexer"
                layers = ["a", "b"]
                enforced_layers = ["a"]
            "#,
        )
        .unwrap();
        let stack = Stack::build(&config).unwrap();
        let ctx = OpContext::none();
        let path = dir.path().join("fanout.bin").to_string_lossy().into_owned();

        let fd = stack.root().open(&path, OpenFlags::create_rdwr(), 0o644, &ctx).unwrap();
        assert_eq!(stack.root().pwrite(fd, b"both", 0, &ctx).unwrap(), 4);
        stack.root().close(fd, &ctx).unwrap();
    }
}
