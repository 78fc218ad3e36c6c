//! TLS context construction and handshake helpers.

use crate::{config::Config, error::Error};
use log::warn;
use openssl::{
    dh::Dh,
    pkey::PKey,
    ssl::{
        Ssl, SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion,
    },
};
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

/// Build the server-side TLS context from configuration.
///
/// Unreadable certificate or key material is a hard error; a rejected
/// cipher list or DH parameter file only degrades to library defaults,
/// and an unrecognized minimum version means TLS 1.2.
pub fn build_acceptor(cfg: &Config) -> Result<SslAcceptor, Error> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

    builder.set_certificate_chain_file(&cfg.ssl_certificate)?;
    let key_path = cfg
        .ssl_certificate_key
        .as_ref()
        .unwrap_or(&cfg.ssl_certificate);
    match &cfg.ssl_password {
        Some(password) => {
            let pem = std::fs::read(key_path)?;
            let key = PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())?;
            builder.set_private_key(&key)?;
        }
        None => builder.set_private_key_file(key_path, SslFiletype::PEM)?,
    }
    builder.check_private_key()?;

    builder.set_min_proto_version(Some(min_tls_version(&cfg.ssl_min_tls_version)))?;

    if let Some(ciphers) = &cfg.ssl_ciphers {
        if let Err(err) = builder.set_cipher_list(ciphers) {
            warn!("cipher list {:?} rejected: {}. Using defaults", ciphers, err);
        }
    }

    if let Some(path) = &cfg.ssl_dhparam {
        match std::fs::read(path).map_err(Error::from).and_then(|pem| {
            let dh = Dh::params_from_pem(&pem)?;
            builder.set_tmp_dh(&dh)?;
            Ok(())
        }) {
            Ok(()) => {}
            Err(err) => warn!("loading dhparams {:?} failed: {}. Using defaults", path, err),
        }
    }

    Ok(builder.build())
}

/// Map the configured minimum version string, falling back to 1.2.
pub fn min_tls_version(value: &str) -> SslVersion {
    match value {
        "1.3" => SslVersion::TLS1_3,
        "1.2" => SslVersion::TLS1_2,
        other => {
            warn!("unknown ssl_min_tls_version {:?}, using 1.2", other);
            SslVersion::TLS1_2
        }
    }
}

/// Server-side handshake on an accepted socket.
pub async fn accept(acceptor: &SslAcceptor, sock: TcpStream) -> Result<SslStream<TcpStream>, Error> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, sock)?;
    Pin::new(&mut stream).accept().await?;
    Ok(stream)
}

/// Client-side handshake without certificate or hostname verification.
///
/// Used by the stats query client, which talks to its own broker over
/// loopback where the server certificate never matches.
pub async fn connect_insecure(
    host: &str,
    sock: TcpStream,
) -> Result<SslStream<TcpStream>, Error> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();

    let mut config = connector.configure()?;
    config.set_verify_hostname(false);
    let ssl = config.into_ssl(host)?;

    let mut stream = SslStream::new(ssl, sock)?;
    Pin::new(&mut stream).connect().await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn min_version_parsing_falls_back_to_1_2() {
        assert_eq!(min_tls_version("1.2"), SslVersion::TLS1_2);
        assert_eq!(min_tls_version("1.3"), SslVersion::TLS1_3);
        assert_eq!(min_tls_version("1.1"), SslVersion::TLS1_2);
        assert_eq!(min_tls_version(""), SslVersion::TLS1_2);
        assert_eq!(min_tls_version("tls1.3"), SslVersion::TLS1_2);
    }

    fn cert_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/certs")
            .join(name)
    }

    fn tls_config() -> Config {
        let mut cfg: Config = toml::from_str(r#"ssl_certificate = "unset""#).unwrap();
        cfg.ssl_certificate = cert_path("cert.pem");
        cfg.ssl_certificate_key = Some(cert_path("key.pem"));
        cfg
    }

    #[test]
    fn acceptor_builds_from_plain_material() {
        build_acceptor(&tls_config()).unwrap();
    }

    #[test]
    fn acceptor_builds_with_passphrase_and_dhparams() {
        let mut cfg = tls_config();
        cfg.ssl_certificate_key = Some(cert_path("key-encrypted.pem"));
        cfg.ssl_password = Some("sekretsekret".to_string());
        cfg.ssl_dhparam = Some(cert_path("dhparam.pem"));
        cfg.ssl_min_tls_version = "1.3".to_string();
        build_acceptor(&cfg).unwrap();
    }

    #[test]
    fn wrong_passphrase_is_an_error() {
        let mut cfg = tls_config();
        cfg.ssl_certificate_key = Some(cert_path("key-encrypted.pem"));
        cfg.ssl_password = Some("not-the-passphrase".to_string());
        assert!(build_acceptor(&cfg).is_err());
    }

    #[test]
    fn missing_material_is_an_error() {
        let mut cfg = tls_config();
        cfg.ssl_certificate = cert_path("no-such-cert.pem");
        assert!(build_acceptor(&cfg).is_err());
    }

    #[test]
    fn rejected_cipher_list_degrades_to_defaults() {
        let mut cfg = tls_config();
        cfg.ssl_ciphers = Some("NOT-A-CIPHER-LIST".to_string());
        build_acceptor(&cfg).unwrap();
    }
}
