use crate::BIN_NAME;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, RsaKeySize, SanType, PKCS_RSA_SHA256,
};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};
use time::OffsetDateTime;
use tokio_rustls::rustls::{self, crypto::ring, sign::CertifiedKey};

/// Lifetime of a generated certificate.
const VALID_FOR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("failed to decode PEM data: {0}")]
    Pem(std::io::Error),

    #[error("no certificate found in the certificate file")]
    NoCertificate,

    #[error("expected exactly one private key, found {0}")]
    PrivateKeyCount(usize),

    #[error("unusable private key: {0}")]
    UnusableKey(rustls::Error),

    #[error("private key does not match the certificate: {0}")]
    Mismatch(rustls::Error),
}

/// Role of an operator supplied file, decided by its path alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileRole {
    PrivateKey,
    Certificate,
    Unrecognized,
}

/// Classify a path by case-insensitive substring: "key" wins over "cer".
pub fn classify(path: &str) -> FileRole {
    let path = path.to_lowercase();
    if path.contains("key") {
        FileRole::PrivateKey
    } else if path.contains("cer") {
        FileRole::Certificate
    } else {
        FileRole::Unrecognized
    }
}

/// Where an [`Identity`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Loaded,
    Generated,
}

/// A certificate chain and the private key it was checked against.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    source: Source,
}

impl Identity {
    /// Decode a PEM certificate chain and private key, then make sure they pair.
    pub fn from_pem(cert: &[u8], key: &[u8], source: Source) -> Result<Self, IdentityError> {
        let cert_chain = rustls_pemfile::certs(&mut &*cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(IdentityError::Pem)?;
        if cert_chain.is_empty() {
            return Err(IdentityError::NoCertificate);
        }

        // Check the entire PEM file for the key in case it is not first section
        let mut keys = rustls_pemfile::read_all(&mut &*key)
            .filter_map(|item| match item {
                Ok(Item::Pkcs8Key(key)) => Some(Ok(PrivateKeyDer::from(key))),
                Ok(Item::Pkcs1Key(key)) => Some(Ok(PrivateKeyDer::from(key))),
                Ok(Item::Sec1Key(key)) => Some(Ok(PrivateKeyDer::from(key))),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(IdentityError::Pem)?;

        let key = match keys.pop() {
            Some(key) if keys.is_empty() => key,
            Some(_) => return Err(IdentityError::PrivateKeyCount(keys.len() + 1)),
            None => return Err(IdentityError::PrivateKeyCount(0)),
        };

        let identity = Self {
            cert_chain,
            key,
            source,
        };
        identity.check_pair()?;
        Ok(identity)
    }

    fn check_pair(&self) -> Result<(), IdentityError> {
        let signing_key = ring::default_provider()
            .key_provider
            .load_private_key(self.key.clone_key())
            .map_err(IdentityError::UnusableKey)?;

        CertifiedKey::new(self.cert_chain.clone(), signing_key)
            .keys_match()
            .map_err(IdentityError::Mismatch)
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (self.cert_chain, self.key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("chain_len", &self.cert_chain.len())
            .field("source", &self.source)
            .finish()
    }
}

/// Resolve the TLS identity from the optional key/certificate arguments.
///
/// Two paths are loaded when both roles can be filled and both files read;
/// otherwise a fresh self-signed identity is generated. A loaded pair that
/// fails to decode or does not match is an error, never a fallback.
pub fn resolve(files: &[String]) -> Result<Identity, IdentityError> {
    match files {
        [] => generate(),
        [first, second] => match read_pair(first, second) {
            Some((cert, key)) => {
                tracing::info!("Using certificate files {} and {}", first, second);
                Identity::from_pem(&cert, &key, Source::Loaded)
            }
            None => {
                tracing::warn!(
                    "Will automatically generate new certificates to be used this session"
                );
                generate()
            }
        },
        _ => {
            tracing::warn!(
                "Expected a key and a certificate file, got {} file(s), generating instead",
                files.len()
            );
            generate()
        }
    }
}

/// Read `(certificate, key)` bytes, or `None` when a role is missing or unreadable.
fn read_pair(first: &str, second: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut key = None;
    let mut cert = None;

    for path in [first, second] {
        let slot = match classify(path) {
            FileRole::PrivateKey => &mut key,
            FileRole::Certificate => &mut cert,
            FileRole::Unrecognized => {
                tracing::warn!("Cannot tell whether {} is a key or a certificate", path);
                continue;
            }
        };
        if slot.replace(path).is_some() {
            tracing::warn!("{} replaces an earlier file with the same role", path);
        }
    }

    let (Some(cert), Some(key)) = (cert, key) else {
        tracing::warn!("Both a key file and a certificate file are required");
        return None;
    };

    match (std::fs::read(cert), std::fs::read(key)) {
        (Ok(cert), Ok(key)) => Some((cert, key)),
        (Err(err), _) | (_, Err(err)) => {
            tracing::warn!("Error reading given KEY/CERT files: {}", err);
            None
        }
    }
}

/// Generate a self-signed identity for `localhost` and `127.0.0.1`.
pub fn generate() -> Result<Identity, IdentityError> {
    let (cert, key) = self_signed_pem()?;
    Identity::from_pem(cert.as_bytes(), key.as_bytes(), Source::Generated)
}

fn self_signed_pem() -> Result<(String, String), rcgen::Error> {
    tracing::info!("Generating self-signed certificate");

    let mut params = CertificateParams::default();
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + VALID_FOR;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, "localhost");
    distinguished_name.push(DnType::OrganizationName, BIN_NAME);
    params.distinguished_name = distinguished_name;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;
    params.subject_alt_names = vec![
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::DnsName("localhost".try_into()?),
    ];

    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)?;
    let cert = params.self_signed(&key_pair)?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}
