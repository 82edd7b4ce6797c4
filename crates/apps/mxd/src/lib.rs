//! Node daemon for the styrene message exchange: loads a TOML node config,
//! listens and/or polls, and hosts a built-in `Echo` service.

pub mod config;

use config::NodeConfig;
use styrene_mx::{MxError, MxRuntime, ServiceRegistry, TlsIdentity};

/// `Echo.Echo(text)` returns its argument; `Echo.Ping()` returns `"pong"`.
pub fn echo_service() -> ServiceRegistry {
    let mut services = ServiceRegistry::new();
    services
        .register("Echo", "Echo", |(text,): (String,)| async move { Ok::<_, MxError>(text) })
        .register("Echo", "Ping", |(): ()| async move { Ok::<_, MxError>("pong".to_string()) });
    services
}

pub fn build_runtime(config: &NodeConfig) -> Result<MxRuntime, MxError> {
    let identity =
        TlsIdentity::from_pem_files(&config.identity.certificate, &config.identity.private_key)?;
    let mut builder =
        MxRuntime::builder(identity).limits(config.limits()?).services(echo_service());
    for thumbprint in &config.trusted {
        builder = builder.trust(thumbprint);
    }
    builder.build()
}
