//! Server configuration.
//!
//! TOML, with a free-form `[stores.*]` section interpreted by the store
//! builder. Every other unknown key is a typo and rejected.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("must specify both cert file and key file or neither")]
    IncompleteKeyPair,
    #[error("invalid auth hash: {0}")]
    InvalidAuthHash(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub listen_address: String,

    /// Name of the store stanza the served data actually lives in. Any
    /// key-value store defined under `[stores.*]` qualifies; see
    /// `burrow_store::Registry::with_defaults` for the available types and
    /// their per-type keys.
    #[serde(default)]
    pub backend: String,

    /// TLS keypair. Specify both or none, in which case the server speaks
    /// plain TCP.
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,

    /// bcrypt hash. When non-empty, connections must win an auth exchange
    /// before any put/get.
    #[serde(default)]
    pub auth_hash: String,

    #[serde(default)]
    pub stores: toml::Table,
}

pub fn load_options(text: &str) -> Result<Options, ConfigError> {
    let opts: Options = toml::from_str(text)?;
    if opts.cert_file.is_empty() != opts.key_file.is_empty() {
        return Err(ConfigError::IncompleteKeyPair);
    }
    if !opts.auth_hash.is_empty() {
        // bcrypt has no standalone hash validator; verifying any password
        // against the hash reports a malformed hash either way.
        if let Err(e) = bcrypt::verify("", &opts.auth_hash) {
            return Err(ConfigError::InvalidAuthHash(e.to_string()));
        }
    }
    Ok(opts)
}

pub fn load_options_from_file(path: &Path) -> Result<Options, ConfigError> {
    load_options(&std::fs::read_to_string(path)?)
}
