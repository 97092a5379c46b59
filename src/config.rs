//! Declarative stack configuration.
//!
//! A TOML document names a `root` layer, a `log_mode`, an optional
//! `[services]` block, and one `[layers.<name>]` table per layer. Layers
//! reference each other by name; the builder resolves names into the
//! runtime tree. Validation here catches everything that can be caught
//! without constructing layers: unknown types (serde), missing references,
//! missing required options, illegal demultiplexer flag combinations, and
//! reference cycles.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use strum::{Display, EnumString};

use crate::codec::CodecKind;
use crate::hashing::HashAlgorithm;

/// Log verbosity selector.
///
/// `screen` duplicates informational output onto stdout; the leveled modes
/// log to stderr at the given severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogMode {
    Disabled,
    Screen,
    Error,
    Warn,
    Info,
    Debug,
}

/// Compression layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    File,
    SparseBlock,
}

/// Anti-tampering mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    File,
    Block,
}

/// The `[services]` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceConfig {
    /// Embedded key/value metadata store.
    Metadata {
        cache_size: u64,
        #[serde(default = "default_service_threads")]
        threads: usize,
        path: Option<String>,
    },
}

fn default_service_threads() -> usize {
    1
}

/// One `[layers.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Local,
    Remote,
    BlockAlign {
        next: String,
        block_size: usize,
    },
    ReadCache {
        next: String,
        block_size: usize,
        num_blocks: usize,
    },
    Benchmark {
        next: String,
        reps: u64,
    },
    Compression {
        next: String,
        algorithm: CodecKind,
        #[serde(default)]
        level: i32,
        mode: CompressionMode,
        block_size: usize,
    },
    Encryption {
        next: String,
        block_size: usize,
        encryption_key: Option<String>,
        api_key: Option<String>,
        vault_addr: Option<String>,
        secret_path: Option<String>,
    },
    AntiTampering {
        data_layer: String,
        hash_layer: String,
        hashes_storage: String,
        algorithm: HashAlgorithm,
        mode: IntegrityMode,
        block_size: Option<usize>,
    },
    Demultiplexer {
        layers: Vec<String>,
        #[serde(default)]
        passthrough_reads: Vec<String>,
        #[serde(default)]
        passthrough_writes: Vec<String>,
        #[serde(default)]
        enforced_layers: Vec<String>,
    },
    S3Opendal {
        endpoint: String,
        access_key_id: String,
        secret_access_key: String,
        region: String,
        bucket: String,
        root: String,
    },
    IpfsOpendal {
        api_endpoint: String,
        root: String,
    },
    Solana {
        rpc_url: String,
        keypair_path: String,
    },
}

impl LayerConfig {
    /// The configuration `type` string for this table.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::BlockAlign { .. } => "block_align",
            Self::ReadCache { .. } => "read_cache",
            Self::Benchmark { .. } => "benchmark",
            Self::Compression { .. } => "compression",
            Self::Encryption { .. } => "encryption",
            Self::AntiTampering { .. } => "anti_tampering",
            Self::Demultiplexer { .. } => "demultiplexer",
            Self::S3Opendal { .. } => "s3_opendal",
            Self::IpfsOpendal { .. } => "ipfs_opendal",
            Self::Solana { .. } => "solana",
        }
    }

    /// Names of the layers this one delegates to.
    #[must_use]
    pub fn children(&self) -> Vec<&str> {
        match self {
            Self::BlockAlign { next, .. }
            | Self::ReadCache { next, .. }
            | Self::Benchmark { next, .. }
            | Self::Compression { next, .. }
            | Self::Encryption { next, .. } => vec![next],
            Self::AntiTampering { data_layer, hash_layer, .. } => {
                vec![data_layer, hash_layer]
            }
            Self::Demultiplexer { layers, .. } => layers.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Name of the entry layer.
    pub root: String,

    /// Log verbosity.
    pub log_mode: LogMode,

    /// Optional embedded services.
    pub services: Option<ServiceConfig>,

    /// Named layer tables.
    #[serde(default)]
    pub layers: HashMap<String, LayerConfig>,
}

impl StackConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Fails on syntax errors, unknown layer types, unknown options, or any
    /// validation rule below.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("malformed configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Structural validation: references, required options, demultiplexer
    /// flag rules, and cycles.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.layers.contains_key(&self.root),
            "root layer '{}' is not defined",
            self.root
        );

        for (name, layer) in &self.layers {
            for child in layer.children() {
                ensure!(
                    self.layers.contains_key(child),
                    "layer '{name}' references undefined layer '{child}'"
                );
            }
            self.validate_layer(name, layer)?;
        }

        self.check_cycles()?;
        Ok(())
    }

    fn validate_layer(&self, name: &str, layer: &LayerConfig) -> Result<()> {
        match layer {
            LayerConfig::BlockAlign { block_size, .. } => {
                ensure!(*block_size > 0, "layer '{name}': block_size must be non-zero");
            }
            LayerConfig::ReadCache { block_size, num_blocks, .. } => {
                ensure!(*block_size > 0, "layer '{name}': block_size must be non-zero");
                ensure!(*num_blocks > 0, "layer '{name}': num_blocks must be non-zero");
            }
            LayerConfig::Benchmark { reps, .. } => {
                ensure!(*reps > 0, "layer '{name}': reps must be non-zero");
            }
            LayerConfig::Compression { mode, block_size, .. } => {
                ensure!(*block_size > 0, "layer '{name}': block_size must be non-zero");
                if *mode == CompressionMode::File {
                    bail!(
                        "layer '{name}': whole-file compression cannot honor positioned \
                         writes; use mode = \"sparse_block\""
                    );
                }
            }
            LayerConfig::Encryption {
                encryption_key, api_key, vault_addr, secret_path, ..
            } => {
                let inline = encryption_key.is_some();
                let vault = [api_key, vault_addr, secret_path];
                let vault_given = vault.iter().filter(|v| v.is_some()).count();
                if inline {
                    ensure!(
                        vault_given == 0,
                        "layer '{name}': encryption_key and the vault options are exclusive"
                    );
                } else {
                    ensure!(
                        vault_given == 3,
                        "layer '{name}': needs encryption_key, or all of api_key, \
                         vault_addr and secret_path"
                    );
                }
            }
            LayerConfig::AntiTampering { mode, block_size, .. } => {
                if *mode == IntegrityMode::Block {
                    ensure!(
                        block_size.is_some_and(|b| b > 0),
                        "layer '{name}': block mode requires a non-zero block_size"
                    );
                }
            }
            LayerConfig::Demultiplexer {
                layers,
                passthrough_reads,
                passthrough_writes,
                enforced_layers,
            } => {
                ensure!(!layers.is_empty(), "layer '{name}': needs at least one child");
                for list in [passthrough_reads, passthrough_writes, enforced_layers] {
                    for referenced in list {
                        ensure!(
                            layers.contains(referenced),
                            "layer '{name}': '{referenced}' is not one of its children"
                        );
                    }
                }
                for child in layers {
                    ensure!(
                        !(passthrough_reads.contains(child)
                            && passthrough_writes.contains(child)),
                        "layer '{name}': child '{child}' cannot be passthrough for both roles"
                    );
                    ensure!(
                        !(passthrough_reads.contains(child) && enforced_layers.contains(child)),
                        "layer '{name}': passthrough_read child '{child}' cannot be enforced"
                    );
                }
                ensure!(
                    layers.iter().any(|c| !passthrough_reads.contains(c)),
                    "layer '{name}': every child is passthrough_read"
                );
                ensure!(
                    layers.iter().any(|c| !passthrough_writes.contains(c)),
                    "layer '{name}': every child is passthrough_write"
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Depth-first search for reference cycles.
    fn check_cycles(&self) -> Result<()> {
        fn visit<'a>(
            config: &'a StackConfig,
            name: &'a str,
            stack: &mut Vec<&'a str>,
            done: &mut Vec<&'a str>,
        ) -> Result<()> {
            if done.contains(&name) {
                return Ok(());
            }
            if stack.contains(&name) {
                bail!("layer reference cycle through '{name}'");
            }
            stack.push(name);
            if let Some(layer) = config.layers.get(name) {
                for child in layer.children() {
                    visit(config, child, stack, done)?;
                }
            }
            stack.pop();
            done.push(name);
            Ok(())
        }

        let mut done = Vec::new();
        for name in self.layers.keys() {
            visit(self, name, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}
