use std::net::{IpAddr, Ipv4Addr};

use axum_server::tls_rustls::RustlsConfig;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use tracelite_core::config::CollectorConfig;
use tracelite_core::error::{Result, TraceLiteError};

/// Loads the configured keypair, or generates a self-signed certificate when
/// auto mode is on. The generated cert carries the names the agent pins:
/// `collector`, `localhost`, and `127.0.0.1`.
pub async fn load_rustls_config(cfg: &CollectorConfig) -> Result<RustlsConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    if let (Some(cert), Some(key)) = (&cfg.tls_cert_file, &cfg.tls_key_file) {
        return RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| TraceLiteError::Io(format!("load tls keypair: {e}")));
    }
    if !cfg.tls_auto_self_signed {
        return Err(TraceLiteError::Config(
            "TLS keypair not configured and TLS_AUTO_SELF_SIGNED is off".to_string(),
        ));
    }

    let (cert_pem, key_pem) = generate_self_signed()?;
    RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
        .await
        .map_err(|e| TraceLiteError::Io(format!("build tls config: {e}")))
}

fn generate_self_signed() -> Result<(String, String)> {
    let mut params =
        CertificateParams::new(vec!["collector".to_string(), "localhost".to_string()])
            .map_err(|e| TraceLiteError::Config(format!("cert params: {e}")))?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "trace-lite-dev");
    dn.push(DnType::CommonName, "collector");
    params.distinguished_name = dn;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(365);

    let key = KeyPair::generate()
        .map_err(|e| TraceLiteError::Config(format!("generate tls key: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| TraceLiteError::Config(format!("self-sign cert: {e}")))?;
    Ok((cert.pem(), key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_emits_pem_pair() {
        let (cert, key) = generate_self_signed().unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn auto_mode_off_without_keypair_is_an_error() {
        let cfg = CollectorConfig {
            tls_auto_self_signed: false,
            ..CollectorConfig::default()
        };
        assert!(load_rustls_config(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn auto_mode_builds_a_config() {
        let cfg = CollectorConfig::default();
        assert!(load_rustls_config(&cfg).await.is_ok());
    }
}
