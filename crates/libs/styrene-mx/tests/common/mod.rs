#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use styrene_mx::{MxError, MxLimits, ServiceEndPoint, ServiceRegistry, TlsIdentity};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity(name: &str) -> TlsIdentity {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).expect("certificate");
    let der = cert.serialize_der().expect("der");
    TlsIdentity::from_der(
        vec![CertificateDer::from(der)],
        PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()).into(),
    )
    .expect("identity")
}

pub fn fast_limits() -> MxLimits {
    MxLimits {
        connect_timeout: Duration::from_secs(5),
        retry_listening_sleep_interval: Duration::from_millis(10),
        polling_queue_wait_timeout: Duration::from_millis(200),
        polling_reconnect_initial_backoff: Duration::from_millis(50),
        polling_reconnect_max_backoff: Duration::from_millis(200),
        ..MxLimits::default()
    }
}

pub fn endpoint(addr: SocketAddr, thumbprint: &str) -> ServiceEndPoint {
    ServiceEndPoint::new(&format!("https://127.0.0.1:{}/", addr.port()), thumbprint)
        .expect("endpoint")
}

/// `Calculator.Add` plus `Calculator.Slow`, counting every invocation.
pub fn calculator(invocations: Arc<AtomicUsize>) -> ServiceRegistry {
    let mut services = ServiceRegistry::new();
    let counter = invocations.clone();
    services.register("Calculator", "Add", move |(a, b): (i64, i64)| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, MxError>(a + b) }
    });
    services.register("Calculator", "Slow", move |seconds: (u64,)| {
        invocations.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_secs(seconds.0)).await;
            Ok::<_, MxError>(seconds.0)
        }
    });
    services
}

/// TCP relay whose live connections can be cut without stopping it.
pub struct Relay {
    addr: SocketAddr,
    generation: Arc<Mutex<CancellationToken>>,
    accepted: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl Relay {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let generation = Arc::new(Mutex::new(CancellationToken::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();

        let task_generation = generation.clone();
        let task_accepted = accepted.clone();
        let task_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let mut inbound = tokio::select! {
                    _ = task_stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => continue,
                    },
                };
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let cut = task_generation.lock().expect("generation").clone();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(target).await else {
                        return;
                    };
                    tokio::select! {
                        _ = cut.cancelled() => {}
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                    }
                });
            }
        });
        Self { addr, generation, accepted, stop }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drops every connection relayed so far; new ones are still accepted.
    pub fn cut_connections(&self) {
        let mut generation = self.generation.lock().expect("generation");
        generation.cancel();
        *generation = CancellationToken::new();
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.cancel();
        self.cut_connections();
    }
}
