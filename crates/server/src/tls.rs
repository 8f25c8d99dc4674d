use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Build a `rustls::ServerConfig` from configured cert/key paths, or from a
/// self-signed certificate persisted under `state_dir` so it survives
/// restarts.
pub fn build_tls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    state_dir: &str,
) -> Result<ServerConfig> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_certs_from_files(cert, key)?,
        _ => load_or_generate_self_signed(state_dir)?,
    };

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")
}

fn load_or_generate_self_signed(
    state_dir: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem_path = format!("{state_dir}/server-cert.pem");
    let key_pem_path = format!("{state_dir}/server-key.pem");

    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state dir {state_dir}"))?;

    if Path::new(&cert_pem_path).exists() && Path::new(&key_pem_path).exists() {
        match load_certs_from_files(&cert_pem_path, &key_pem_path) {
            Ok(pair) => {
                tracing::info!("Loaded existing self-signed cert from {cert_pem_path}");
                return Ok(pair);
            }
            Err(err) => {
                tracing::warn!("Existing self-signed cert invalid, regenerating: {err}");
            }
        }
    }

    let (certs, key) = generate_self_signed()?;

    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", certs[0].to_vec()));
    std::fs::write(&cert_pem_path, cert_pem.as_bytes())
        .context("Failed to write self-signed cert PEM")?;

    // Key file gets restricted permissions.
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let key_bytes = match &key {
            PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der(),
            _ => unreachable!("generate_self_signed always produces PKCS8"),
        };
        let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", key_bytes.to_vec()));
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&key_pem_path)
            .and_then(|mut f| f.write_all(key_pem.as_bytes()))
            .context("Failed to write self-signed key PEM")?;
    }

    tracing::info!("Generated self-signed cert: {cert_pem_path} + {key_pem_path}");
    Ok((certs, key))
}

/// Load certificate chain and private key from PEM files on disk.
fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    tracing::info!("Generating self-signed TLS certificate");

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to create certificate params")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::LOCALHOST,
        )));
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::V6(
            std::net::Ipv6Addr::LOCALHOST,
        )));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

/// Helper to create a `tokio_rustls::TlsAcceptor`.
pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
