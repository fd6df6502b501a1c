// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TLS for node connections.
//!
//! `NoSsl` uses plain TCP. `SelfSigned` generates a throwaway certificate at
//! start-up and, as a client, accepts any server certificate (handshake
//! signatures are still verified). `SystemSsl` loads a PEM certificate and
//! key and verifies servers against the webpki roots plus that certificate.

use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AppError, AppResult, NodeConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    #[default]
    NoSsl,
    SystemSsl,
    SelfSigned,
}

/// Subject of a generated certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateRequest {
    pub country: String,
    pub organization: String,
    pub common_name: String,
    pub validity_days: u32,
}

impl Default for CertificateRequest {
    fn default() -> Self {
        CertificateRequest {
            country: "US".to_string(),
            organization: "Heart".to_string(),
            common_name: "localhost".to_string(),
            validity_days: 365,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate_self_signed(request: &CertificateRequest) -> AppResult<CertificateBundle> {
    if request.validity_days == 0 {
        return Err(AppError::CertificateError(
            "validity_days must be > 0".to_string(),
        ));
    }
    let mut params = CertificateParams::new(vec![request.common_name.clone()])?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CountryName, request.country.as_str());
    name.push(DnType::OrganizationName, request.organization.as_str());
    name.push(DnType::CommonName, request.common_name.as_str());
    params.distinguished_name = name;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after =
        now + Duration::from_secs(u64::from(request.validity_days) * 24 * 60 * 60);
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    debug!(
        "generated self-signed certificate for {} valid {} days",
        request.common_name, request.validity_days
    );
    Ok(CertificateBundle {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Source of rustls configurations for one TLS mode.
pub trait TlsProvider: Send + Sync {
    fn server_config(&self) -> AppResult<Arc<ServerConfig>>;

    fn client_config(&self) -> AppResult<Arc<ClientConfig>>;
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(pem: &str) -> AppResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::CertificateError(format!("parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(AppError::CertificateError("no certificate found".to_string()));
    }
    Ok(certs)
}

fn load_key(pem: &str) -> AppResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AppError::CertificateError(format!("parse private key: {}", e)))?
        .ok_or_else(|| AppError::CertificateError("no private key found".to_string()))
}

fn build_server_config(cert_pem: &str, key_pem: &str) -> AppResult<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(load_certs(cert_pem)?, load_key(key_pem)?)?;
    Ok(Arc::new(config))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub struct SelfSignedProvider {
    bundle: CertificateBundle,
}

impl SelfSignedProvider {
    pub fn new(request: &CertificateRequest) -> AppResult<Self> {
        Ok(SelfSignedProvider {
            bundle: generate_self_signed(request)?,
        })
    }

    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }
}

impl TlsProvider for SelfSignedProvider {
    fn server_config(&self) -> AppResult<Arc<ServerConfig>> {
        build_server_config(&self.bundle.cert_pem, &self.bundle.key_pem)
    }

    fn client_config(&self) -> AppResult<Arc<ClientConfig>> {
        let provider = crypto_provider();
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Certificate and key read from PEM files.
///
/// Without files the provider can still act as a client.
pub struct FileTlsProvider {
    cert_pem: Option<String>,
    key_pem: Option<String>,
}

impl FileTlsProvider {
    pub fn new(cert_path: Option<&str>, key_path: Option<&str>) -> AppResult<Self> {
        let read = |path: Option<&str>| -> AppResult<Option<String>> {
            path.map(|path| {
                fs::read_to_string(path).map_err(|e| {
                    AppError::CertificateError(format!("read {}: {}", path, e))
                })
            })
            .transpose()
        };
        Ok(FileTlsProvider {
            cert_pem: read(cert_path)?,
            key_pem: read(key_path)?,
        })
    }
}

impl TlsProvider for FileTlsProvider {
    fn server_config(&self) -> AppResult<Arc<ServerConfig>> {
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert_pem), Some(key_pem)) => build_server_config(cert_pem, key_pem),
            _ => Err(AppError::CertificateError(
                "system_ssl server needs a certificate and a key".to_string(),
            )),
        }
    }

    fn client_config(&self) -> AppResult<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(cert_pem) = &self.cert_pem {
            for cert in load_certs(cert_pem)? {
                if let Err(e) = roots.add(cert) {
                    warn!("configured certificate not usable as trust root: {}", e);
                }
            }
        }
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Builds the provider for `mode`; `None` for plain TCP.
pub fn provider_for(mode: TlsMode, config: &NodeConfig) -> AppResult<Option<Arc<dyn TlsProvider>>> {
    Ok(match mode {
        TlsMode::NoSsl => None,
        TlsMode::SelfSigned => Some(Arc::new(SelfSignedProvider::new(&config.certificate)?)),
        TlsMode::SystemSsl => Some(Arc::new(FileTlsProvider::new(
            config.tls_cert_path.as_deref(),
            config.tls_key_path.as_deref(),
        )?)),
    })
}

/// Name presented to the server: the host when known, the IP otherwise.
pub fn server_name(host: Option<&str>, ip: IpAddr) -> AppResult<ServerName<'static>> {
    match host {
        Some(host) => ServerName::try_from(host.to_string())
            .map_err(|e| AppError::TlsError(format!("invalid server name {}: {}", host, e))),
        None => Ok(ServerName::IpAddress(ip.into())),
    }
}
