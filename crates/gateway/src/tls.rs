//! TLS material for the HTTPS interceptor.
//!
//! On first run a self-signed certificate covering the four intercept
//! domains is generated and written beside the config; later runs load
//! the PEM pair back. Unusable material is fatal at startup.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// The hosts-file entries the proxy expects to intercept.
pub const INTERCEPT_DOMAINS: [&str; 4] = [
    "www.growtopia1.com",
    "growtopia1.com",
    "www.growtopia2.com",
    "growtopia2.com",
];

pub fn server_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (certs, key) = if cert_path.is_file() && key_path.is_file() {
        load_material(cert_path, key_path)?
    } else {
        generate_material(cert_path, key_path)?
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build rustls server config")?;
    Ok(Arc::new(config))
}

fn load_material(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(
        fs::File::open(cert_path)
            .with_context(|| format!("open certificate {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate pem {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }

    let mut key_reader = BufReader::new(
        fs::File::open(key_path).with_context(|| format!("open key {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse key pem {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;

    tracing::info!("tls.loaded cert={}", cert_path.display());
    Ok((certs, key))
}

fn generate_material(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let sans: Vec<String> = INTERCEPT_DOMAINS.iter().map(|d| d.to_string()).collect();
    let certified =
        rcgen::generate_simple_self_signed(sans).context("generate self-signed certificate")?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create tls dir {}", parent.display()))?;
            }
        }
    }
    fs::write(cert_path, certified.cert.pem())
        .with_context(|| format!("write certificate {}", cert_path.display()))?;
    fs::write(key_path, certified.key_pair.serialize_pem())
        .with_context(|| format!("write key {}", key_path.display()))?;
    tracing::info!(
        "tls.generated cert={} key={} sans={}",
        cert_path.display(),
        key_path.display(),
        INTERCEPT_DOMAINS.join(",")
    );

    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
    let cert = CertificateDer::from(certified.cert);
    Ok((vec![cert], key))
}
