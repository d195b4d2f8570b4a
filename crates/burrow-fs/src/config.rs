//! Filesystem daemon configuration.

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
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyPairConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    /// Name of this filesystem instance, for log lines.
    #[serde(default)]
    pub name: String,

    /// `host:port` of the metadata server.
    #[serde(default)]
    pub metadata_server: String,

    #[serde(default)]
    pub debug: bool,

    /// Secret for the server's auth exchange, when it requires one.
    #[serde(default)]
    pub auth_key: String,

    /// Talk plain TCP when the server has no TLS. Development only.
    #[serde(default)]
    pub fallback_to_plain_tcp: bool,

    /// Where file content blocks live. Defaults to `~/lib/burrow/blobs`.
    #[serde(default)]
    pub blob_dir: String,

    /// Client TLS keypair.
    #[serde(default)]
    pub key_pair: Option<KeyPairConfig>,
}

pub fn load_options(text: &str) -> Result<Options, ConfigError> {
    let opts: Options = toml::from_str(text)?;
    if let Some(kp) = &opts.key_pair {
        if kp.cert_file.is_empty() || kp.key_file.is_empty() {
            return Err(ConfigError::IncompleteKeyPair);
        }
    }
    Ok(opts)
}

pub fn load_options_from_file(path: &Path) -> Result<Options, ConfigError> {
    load_options(&std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let opts = load_options(
            r#"
name = "laptop"
metadata_server = "meta.example.org:6660"
debug = true
auth_key = "foobar"
blob_dir = "~/lib/burrow/blobs"

[key_pair]
cert_file = "~/lib/burrow/cert.pem"
key_file = "~/lib/burrow/key.pem"
"#,
        )
        .unwrap();
        assert_eq!(opts.name, "laptop");
        assert_eq!(opts.metadata_server, "meta.example.org:6660");
        assert!(opts.debug);
        assert!(opts.key_pair.is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            load_options("metadata_sever = \"typo:6660\"\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn empty_key_pair_members_are_rejected() {
        assert!(matches!(
            load_options("[key_pair]\ncert_file = \"cert.pem\"\nkey_file = \"\"\n"),
            Err(ConfigError::IncompleteKeyPair)
        ));
    }
}
