//! CLI commands and argument parsing.
//!
//! Thin glue: every subcommand loads the configuration, builds the stack,
//! and drives exactly one operation against the root layer.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use bytesize::ByteSize;
use clap::{Parser, Subcommand};

use crate::builder::Stack;
use crate::config::StackConfig;
use crate::layer::{OpContext, OpenFlags};
use crate::logging;

/// TamperStack - a composable, tamper-evident I/O layer stack.
#[derive(Parser)]
#[command(name = "tamperstack")]
#[command(version)]
#[command(
    about = "Build a layered I/O stack from a TOML configuration and run file \
             operations through it."
)]
pub struct Cli {
    /// Path to the stack configuration.
    #[arg(short, long, global = true, default_value = "stack.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration and build the tree once.
    Check,

    /// Print file attributes as seen through the stack.
    Stat {
        /// Path inside the stack.
        path: String,
    },

    /// Read a byte range to standard output.
    Read {
        /// Path inside the stack.
        path: String,

        /// Starting offset.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Bytes to read; defaults to the rest of the file.
        #[arg(short, long)]
        len: Option<u64>,
    },

    /// Write bytes at an offset, creating the file if needed.
    Write {
        /// Path inside the stack.
        path: String,

        /// Starting offset.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Literal data to write.
        #[arg(short, long)]
        data: String,
    },

    /// Remove a path and its layer sidecars.
    Unlink {
        /// Path inside the stack.
        path: String,
    },
}

impl Cli {
    /// Parses arguments from the process environment.
    #[must_use]
    pub fn init() -> Self {
        Self::parse()
    }

    /// Runs the selected command.
    pub fn execute(self) -> Result<()> {
        let config = StackConfig::from_path(&self.config)?;
        logging::init(config.log_mode);
        let stack = Stack::build(&config)?;

        match self.command {
            Commands::Check => {
                println!("{}", stack.summary());
                Ok(())
            }
            Commands::Stat { path } => stat(&stack, &path),
            Commands::Read { path, offset, len } => read(&stack, &path, offset, len),
            Commands::Write { path, offset, data } => write(&stack, &path, offset, &data),
            Commands::Unlink { path } => {
                stack.root().unlink(&path, &OpContext::none())?;
                Ok(())
            }
        }
    }
}

fn stat(stack: &Stack, path: &str) -> Result<()> {
    let stat = stack.root().lstat(path, &OpContext::none())?;
    println!(
        "{path}: {} ({} bytes), mode {:o}, dev {} ino {}",
        ByteSize(stat.size),
        stat.size,
        stat.mode,
        stat.dev,
        stat.ino
    );
    Ok(())
}

fn read(stack: &Stack, path: &str, offset: u64, len: Option<u64>) -> Result<()> {
    let ctx = OpContext::none();
    let root = stack.root();
    let fd = root.open(path, OpenFlags::read_only(), 0, &ctx)?;

    let result = (|| {
        let len = match len {
            Some(len) => len,
            None => root.fstat(fd, &ctx)?.size.saturating_sub(offset),
        };
        let mut buf = vec![0u8; usize::try_from(len).context("length does not fit in memory")?];
        let got = root.pread(fd, &mut buf, offset, &ctx)?;
        std::io::stdout().write_all(&buf[..got])?;
        Ok(())
    })();

    root.close(fd, &ctx)?;
    result
}

fn write(stack: &Stack, path: &str, offset: u64, data: &str) -> Result<()> {
    let ctx = OpContext::none();
    let root = stack.root();
    let fd = root.open(path, OpenFlags::create_rdwr(), 0o644, &ctx)?;

    let result = (|| {
        let written = root.pwrite(fd, data.as_bytes(), offset, &ctx)?;
        ensure!(written == data.len(), "short write: {written} of {} bytes", data.len());
        Ok(())
    })();

    root.close(fd, &ctx)?;
    result
}
