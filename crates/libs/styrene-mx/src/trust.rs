use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::endpoint::normalize_thumbprint;

/// Upper-case hex SHA-256 of a DER certificate.
pub fn thumbprint(certificate_der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(certificate_der))
}

/// Subject common name of a certificate, for log lines.
pub fn describe_certificate(certificate_der: &[u8]) -> String {
    let Ok((_remaining, certificate)) = X509Certificate::from_der(certificate_der) else {
        return "<unparseable certificate>".to_string();
    };
    let name = certificate
        .subject()
        .iter_common_name()
        .find_map(|name| name.as_str().ok().map(str::to_string))
        .unwrap_or_else(|| certificate.subject().to_string());
    name
}

/// Thumbprints this process accepts as peers.
#[derive(Debug, Default)]
pub struct TrustStore {
    thumbprints: RwLock<HashSet<String>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thumbprints<I, S>(thumbprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = thumbprints.into_iter().map(|t| normalize_thumbprint(t.as_ref())).collect();
        Self { thumbprints: RwLock::new(set) }
    }

    /// Returns `true` if the thumbprint was not trusted before.
    pub fn add(&self, thumbprint: &str) -> bool {
        let mut thumbprints = self.thumbprints.write().unwrap_or_else(|err| err.into_inner());
        thumbprints.insert(normalize_thumbprint(thumbprint))
    }

    /// Returns `true` if the thumbprint was trusted.
    pub fn remove(&self, thumbprint: &str) -> bool {
        let mut thumbprints = self.thumbprints.write().unwrap_or_else(|err| err.into_inner());
        thumbprints.remove(&normalize_thumbprint(thumbprint))
    }

    /// Replaces the whole set and returns the thumbprints that lost trust.
    pub fn trust_only<I, S>(&self, thumbprints: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let replacement: HashSet<String> =
            thumbprints.into_iter().map(|t| normalize_thumbprint(t.as_ref())).collect();
        let mut current = self.thumbprints.write().unwrap_or_else(|err| err.into_inner());
        let mut revoked: Vec<String> = current.difference(&replacement).cloned().collect();
        revoked.sort();
        *current = replacement;
        revoked
    }

    pub fn is_trusted(&self, thumbprint: &str) -> bool {
        let thumbprints = self.thumbprints.read().unwrap_or_else(|err| err.into_inner());
        thumbprints.contains(&normalize_thumbprint(thumbprint))
    }

    pub fn thumbprints(&self) -> Vec<String> {
        let thumbprints = self.thumbprints.read().unwrap_or_else(|err| err.into_inner());
        let mut list: Vec<_> = thumbprints.iter().cloned().collect();
        list.sort();
        list
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthorizedClientDecision {
    Block,
    /// Block, and keep refusing this thumbprint without asking again until
    /// the process exits.
    BlockForProcessLifetime,
    TrustAndAllow,
}

/// Decides what happens when a client presents an unknown certificate.
pub trait UnauthorizedClientConnect: Send + Sync {
    fn decide(&self, thumbprint: &str, subject: &str) -> UnauthorizedClientDecision;
}

impl<F> UnauthorizedClientConnect for F
where
    F: Fn(&str, &str) -> UnauthorizedClientDecision + Send + Sync,
{
    fn decide(&self, thumbprint: &str, subject: &str) -> UnauthorizedClientDecision {
        self(thumbprint, subject)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockUnauthorized;

impl UnauthorizedClientConnect for BlockUnauthorized {
    fn decide(&self, _thumbprint: &str, _subject: &str) -> UnauthorizedClientDecision {
        UnauthorizedClientDecision::Block
    }
}

/// Inbound certificate policy: blocked set, then trust store, then the
/// unauthorized-connect handler.
pub struct ClientAuthorizer {
    trust: Arc<TrustStore>,
    blocked: RwLock<HashSet<String>>,
    handler: Arc<dyn UnauthorizedClientConnect>,
}

impl ClientAuthorizer {
    pub fn new(trust: Arc<TrustStore>, handler: Arc<dyn UnauthorizedClientConnect>) -> Self {
        Self { trust, blocked: RwLock::new(HashSet::new()), handler }
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Returns the certificate's thumbprint when the client may connect.
    pub fn authorize(&self, certificate_der: &[u8]) -> Option<String> {
        let thumbprint = thumbprint(certificate_der);
        if self.is_blocked(&thumbprint) {
            log::debug!("mx_listener: refusing blocked client {}", thumbprint);
            return None;
        }
        if self.trust.is_trusted(&thumbprint) {
            return Some(thumbprint);
        }

        let subject = describe_certificate(certificate_der);
        match self.handler.decide(&thumbprint, &subject) {
            UnauthorizedClientDecision::TrustAndAllow => {
                log::info!("mx_listener: trusting new client {} ({})", thumbprint, subject);
                self.trust.add(&thumbprint);
                Some(thumbprint)
            }
            UnauthorizedClientDecision::Block => {
                log::warn!("mx_listener: rejected untrusted client {} ({})", thumbprint, subject);
                None
            }
            UnauthorizedClientDecision::BlockForProcessLifetime => {
                log::warn!(
                    "mx_listener: rejected untrusted client {} ({}) until restart",
                    thumbprint,
                    subject
                );
                self.blocked.write().unwrap_or_else(|err| err.into_inner()).insert(thumbprint);
                None
            }
        }
    }

    pub fn is_blocked(&self, thumbprint: &str) -> bool {
        self.blocked.read().unwrap_or_else(|err| err.into_inner()).contains(thumbprint)
    }
}

impl std::fmt::Debug for ClientAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthorizer").field("trust", &self.trust).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn certificate(name: &str) -> Vec<u8> {
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .expect("generate")
            .serialize_der()
            .expect("der")
    }

    #[test]
    fn thumbprints_are_upper_case_sha256() {
        let der = certificate("localhost");
        let value = thumbprint(&der);
        assert_eq!(value.len(), 64);
        assert_eq!(value, value.to_ascii_uppercase());
        assert_eq!(value, thumbprint(&der));
        assert_eq!(describe_certificate(b"junk"), "<unparseable certificate>");
    }

    #[test]
    fn describes_certificates_by_common_name() {
        // rcgen's default subject for simple self-signed certificates.
        assert_eq!(describe_certificate(&certificate("localhost")), "rcgen self signed cert");
    }

    #[test]
    fn trust_store_normalises_and_reports_revocations() {
        let store = TrustStore::with_thumbprints(["aa:bb", "CC"]);
        assert!(store.is_trusted("AABB"));
        assert!(!store.add("aabb"));
        assert!(store.add("dd"));
        assert!(store.remove("cc"));
        assert!(!store.is_trusted("CC"));

        let revoked = store.trust_only(["DD", "EE"]);
        assert_eq!(revoked, vec!["AABB".to_string()]);
        assert_eq!(store.thumbprints(), vec!["DD".to_string(), "EE".to_string()]);
    }

    #[test]
    fn authorizer_consults_handler_only_for_unknown_clients() {
        let trusted = certificate("trusted");
        let stranger = certificate("stranger");
        let store = Arc::new(TrustStore::with_thumbprints([thumbprint(&trusted)]));
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let authorizer = ClientAuthorizer::new(
            store.clone(),
            Arc::new(move |_: &str, _: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                UnauthorizedClientDecision::BlockForProcessLifetime
            }),
        );

        assert_eq!(authorizer.authorize(&trusted), Some(thumbprint(&trusted)));
        assert_eq!(authorizer.authorize(&stranger), None);
        assert_eq!(authorizer.authorize(&stranger), None);
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(authorizer.is_blocked(&thumbprint(&stranger)));

        // Blocking wins even over a later trust decision.
        store.add(&thumbprint(&stranger));
        assert_eq!(authorizer.authorize(&stranger), None);
    }

    #[test]
    fn trust_and_allow_adds_the_client() {
        let stranger = certificate("stranger");
        let store = Arc::new(TrustStore::new());
        let authorizer = ClientAuthorizer::new(
            store.clone(),
            Arc::new(|_: &str, _: &str| UnauthorizedClientDecision::TrustAndAllow),
        );
        assert!(authorizer.authorize(&stranger).is_some());
        assert!(store.is_trusted(&thumbprint(&stranger)));
    }
}
