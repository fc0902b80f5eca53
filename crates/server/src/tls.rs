//! Mutually authenticated TLS configuration. Certificate provisioning (and
//! attestation, in enclave deployments) happens outside the server; we just
//! load PEM material from the configured paths.

use std::{
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use common::knobs::{
    TLS_CA_PATH,
    TLS_CERT_PATH,
    TLS_KEY_PATH,
};
use rustls::{
    server::WebPkiClientVerifier,
    RootCertStore,
    ServerConfig,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
    PrivateKeyDer,
};

pub fn server_config() -> anyhow::Result<Arc<ServerConfig>> {
    server_config_from_paths(
        Path::new(&*TLS_CERT_PATH),
        Path::new(&*TLS_KEY_PATH),
        Path::new(&*TLS_CA_PATH),
    )
}

pub fn server_config_from_paths(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> anyhow::Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("reading certificate chain {}", cert_path.display()))?
        .collect::<Result<_, _>>()
        .context("parsing certificate chain")?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("reading private key {}", key_path.display()))?;

    let mut roots = RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(ca_path)
        .with_context(|| format!("reading client CA {}", ca_path.display()))?
    {
        roots.add(ca.context("parsing client CA certificate")?)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client certificate verifier")?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("assembling TLS server config")?;
    Ok(Arc::new(config))
}
