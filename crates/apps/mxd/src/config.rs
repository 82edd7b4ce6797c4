use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use styrene_mx::{MxError, MxLimits, ServiceEndPoint};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub listen: Option<String>,
    #[serde(default)]
    pub trusted: Vec<String>,
    #[serde(default, rename = "poll")]
    pub polls: Vec<PollConfig>,
    #[serde(default)]
    pub limits: Option<MxLimits>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// A listening server this node subscribes to.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    pub subscription: String,
    pub server: String,
    pub thumbprint: String,
    pub proxy: Option<String>,
}

impl NodeConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Reads a config file; relative identity paths are resolved against
    /// the file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        if let Some(base) = path.parent() {
            config.identity.certificate = base.join(&config.identity.certificate);
            config.identity.private_key = base.join(&config.identity.private_key);
        }
        Ok(config)
    }

    pub fn limits(&self) -> Result<MxLimits, MxError> {
        let limits = self.limits.clone().unwrap_or_default();
        limits.validate()?;
        Ok(limits)
    }

    /// `(subscription, server)` pairs to hand to `MxRuntime::poll`.
    pub fn poll_targets(&self) -> Result<Vec<(String, ServiceEndPoint)>, MxError> {
        self.polls
            .iter()
            .map(|poll| {
                let mut server = ServiceEndPoint::new(&poll.server, &poll.thumbprint)?;
                if let Some(proxy) = &poll.proxy {
                    server = server.with_proxy(proxy.clone());
                }
                Ok((poll.subscription.clone(), server))
            })
            .collect()
    }
}
