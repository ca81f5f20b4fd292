//! TLS acceptor construction from PEM material.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::TlsConfig;

pub(crate) fn acceptor(tls: &TlsConfig) -> crate::Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;

    let builder = match &tls.ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| crate::Error::new_listen(other(e.to_string())))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| crate::Error::new_listen(other(e.to_string())))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| crate::Error::new_listen(other(e.to_string())))?;
    debug!("tls acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &std::path::Path) -> crate::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(crate::Error::new_listen)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(crate::Error::new_listen)
}

fn load_key(path: &std::path::Path) -> crate::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(crate::Error::new_listen)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(crate::Error::new_listen)?
        .ok_or_else(|| crate::Error::new_listen(other("no private key in key file".into())))
}

fn other(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
