//! Command-line arguments and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`dropwire.toml` in the working directory, or `--config`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "dropwire.toml";

/// Dropwire - direct peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file. Defaults to ./dropwire.toml when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Payload bytes per data frame.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// STUN/TURN server URL. Repeat for several; replaces the configured list.
    #[clap(long = "ice-server", global = true)]
    pub ice_servers: Vec<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Send one or more files to a peer.
    Send {
        #[clap(required = true)]
        files: Vec<PathBuf>,

        /// Name shown when asking for the receiver's code.
        #[clap(long, default_value = "receiver")]
        peer: String,
    },
    /// Wait for a peer and save the files it sends.
    Receive {
        /// Directory received files are written to.
        #[clap(long, default_value = ".")]
        out: PathBuf,

        /// Local id to publish. Random when omitted.
        #[clap(long)]
        id: Option<String>,
    },
    /// Send files between two in-process peers over the loopback transport.
    Demo {
        #[clap(required = true)]
        files: Vec<PathBuf>,

        #[clap(long, default_value = "./dropwire-demo")]
        out: PathBuf,
    },
}

/// Contents of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub ice_servers: Vec<String>,
}

/// Effective settings after merging file and CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub engine: EngineConfig,
    pub ice_servers: Vec<String>,
}

impl Args {
    /// Load the file config (if any) and apply CLI overrides.
    pub fn settings(&self) -> Result<Settings, EngineError> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let explicit = self.config.is_some();
        let file = Self::from_file(&path, explicit)?;
        self.merge(file)
    }

    /// A missing default file is fine; a missing explicit one is not.
    fn from_file(path: &Path, explicit: bool) -> Result<FileConfig, EngineError> {
        if !path.exists() {
            if explicit {
                return Err(EngineError::Config(format!(
                    "{}: no such file",
                    path.display()
                )));
            }
            return Ok(FileConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    fn merge(&self, file: FileConfig) -> Result<Settings, EngineError> {
        let mut engine = file.engine;
        if let Some(chunk_size) = self.chunk_size {
            engine.chunk_size = chunk_size;
        }
        engine.validate()?;

        let ice_servers = if self.ice_servers.is_empty() {
            file.ice_servers
        } else {
            self.ice_servers.clone()
        };
        Ok(Settings {
            engine,
            ice_servers,
        })
    }
}
