//! Configuration: a plain `key = value` file with `#` comments. Dotted keys
//! group the transport options; `bootstrap.address` may repeat.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

const APP_NAME: &str = "veilpost";

/// Transport bridge endpoint (a SAM-like UDP/TCP pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamConfig {
    pub address: String,
    pub tcp: u16,
    pub udp: u16,
    pub name: String,
}

impl Default for SamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            tcp: 7656,
            udp: 7655,
            name: "pbote".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// External IP announced to the bridge.
    pub host: String,
    /// Local listener port.
    pub port: u16,
    pub sam: SamConfig,
    /// Base64 destinations used when the peer file is empty.
    pub bootstrap: Vec<String>,
    pub datadir: PathBuf,
    /// debug | info | warn | error | none
    pub loglevel: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5050,
            sam: SamConfig::default(),
            bootstrap: Vec::new(),
            datadir: default_datadir(),
            loglevel: "info".to_string(),
        }
    }
}

fn default_datadir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(format!(".{APP_NAME}")),
        _ => std::env::temp_dir().join(APP_NAME),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = lineno + 1, "config line without '=' ignored");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "host" => config.host = value.to_string(),
                "port" => {
                    config.port = value
                        .parse()
                        .with_context(|| format!("invalid port {value:?}"))?;
                }
                "sam.address" => config.sam.address = value.to_string(),
                "sam.tcp" => {
                    config.sam.tcp = value
                        .parse()
                        .with_context(|| format!("invalid sam.tcp {value:?}"))?;
                }
                "sam.udp" => {
                    config.sam.udp = value
                        .parse()
                        .with_context(|| format!("invalid sam.udp {value:?}"))?;
                }
                "sam.name" => config.sam.name = value.to_string(),
                "bootstrap.address" => config.bootstrap.push(value.to_string()),
                "datadir" => {
                    if !value.is_empty() {
                        config.datadir = PathBuf::from(value);
                    }
                }
                "loglevel" => config.loglevel = value.to_string(),
                other => warn!(key = other, "unrecognized config key ignored"),
            }
        }
        Ok(config)
    }

    pub fn nodes_file(&self) -> PathBuf {
        self.datadir.join("nodes.txt")
    }

    pub fn dht_dir(&self) -> PathBuf {
        self.datadir.join("dht")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.datadir.join("inbox")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.datadir.join("outbox")
    }

    pub fn sent_dir(&self) -> PathBuf {
        self.datadir.join("sent")
    }

    pub fn incomplete_dir(&self) -> PathBuf {
        self.datadir.join("incomplete")
    }

    /// Create the data directory tree. Failure here is fatal at startup.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.datadir.clone(),
            self.dht_dir(),
            self.inbox_dir(),
            self.outbox_dir(),
            self.sent_dir(),
            self.incomplete_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        Ok(())
    }
}
