//! Secure channel setup for both ends of the federation link.
//!
//! Certificate material is read from `cert_dir` (or explicit per-file paths),
//! checked with `rustls-pemfile`, and turned into tonic TLS configs. Nothing
//! here downgrades silently: plain transport requires `allow_insecure: true`.

use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use rcgen::{BasicConstraints, Certificate as RcgenCert, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, SanType};
use serde::{Deserialize, Serialize};
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

use crate::error::FederationError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_true")]
    pub mutual_auth: bool,
    /// Required to run with `enabled: false`.
    #[serde(default)]
    pub allow_insecure: bool,
    /// Development only: mint a CA plus server/client pairs when `ca.crt` is absent.
    #[serde(default)]
    pub auto_generate_cert: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_dir: default_cert_dir(),
            ca_path: None,
            cert_path: None,
            key_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: default_server_name(),
            mutual_auth: true,
            allow_insecure: false,
            auto_generate_cert: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_cert_dir() -> PathBuf { PathBuf::from("certs") }
fn default_server_name() -> String { "localhost".into() }

impl TlsSettings {
    pub fn ca_file(&self) -> PathBuf { self.ca_path.clone().unwrap_or_else(|| self.cert_dir.join("ca.crt")) }
    pub fn server_cert_file(&self) -> PathBuf { self.cert_path.clone().unwrap_or_else(|| self.cert_dir.join("server.crt")) }
    pub fn server_key_file(&self) -> PathBuf { self.key_path.clone().unwrap_or_else(|| self.cert_dir.join("server.key")) }
    pub fn client_cert_file(&self) -> PathBuf { self.client_cert_path.clone().unwrap_or_else(|| self.cert_dir.join("client.crt")) }
    pub fn client_key_file(&self) -> PathBuf { self.client_key_path.clone().unwrap_or_else(|| self.cert_dir.join("client.key")) }

    fn check_plaintext_allowed(&self) -> Result<(), FederationError> {
        if self.allow_insecure {
            warn!("tls_disabled_plaintext_transport");
            Ok(())
        } else {
            Err(FederationError::Configuration(
                "security.tls.enabled is false but allow_insecure is not set".into(),
            ))
        }
    }

    fn ensure_material(&self) -> Result<(), FederationError> {
        if self.auto_generate_cert && !self.ca_file().exists() {
            generate_dev_certificates(&self.cert_dir, &self.server_name)?;
        }
        Ok(())
    }
}

/// How the aggregator accepts connections.
pub enum ServerTransport {
    Plain,
    Tls(ServerTlsConfig),
}

impl ServerTransport {
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, FederationError> {
        let tls = &settings.tls;
        if !tls.enabled {
            tls.check_plaintext_allowed()?;
            return Ok(ServerTransport::Plain);
        }
        tls.ensure_material()?;
        let identity = load_identity(&tls.server_cert_file(), &tls.server_key_file())?;
        let mut cfg = ServerTlsConfig::new().identity(identity);
        if tls.mutual_auth {
            cfg = cfg.client_ca_root(load_ca(&tls.ca_file())?);
        }
        info!(mutual_auth = tls.mutual_auth, "server_tls_configured");
        Ok(ServerTransport::Tls(cfg))
    }

    pub fn is_tls(&self) -> bool { matches!(self, ServerTransport::Tls(_)) }

    pub fn apply(self, builder: Server) -> Result<Server, FederationError> {
        match self {
            ServerTransport::Plain => Ok(builder),
            ServerTransport::Tls(cfg) => {
                builder.tls_config(cfg).map_err(|e| FederationError::Configuration(format!("server tls: {e}")))
            }
        }
    }
}

/// How a collaborator dials the aggregator.
#[derive(Clone)]
pub enum ClientTransport {
    Plain,
    Tls(ClientTlsConfig),
}

impl ClientTransport {
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, FederationError> {
        let tls = &settings.tls;
        if !tls.enabled {
            tls.check_plaintext_allowed()?;
            return Ok(ClientTransport::Plain);
        }
        tls.ensure_material()?;
        let mut cfg = ClientTlsConfig::new().ca_certificate(load_ca(&tls.ca_file())?).domain_name(tls.server_name.clone());
        if tls.mutual_auth {
            cfg = cfg.identity(load_identity(&tls.client_cert_file(), &tls.client_key_file())?);
        }
        Ok(ClientTransport::Tls(cfg))
    }

    pub fn is_tls(&self) -> bool { matches!(self, ClientTransport::Tls(_)) }

    /// Dial URI for `address`; a scheme already present is kept.
    pub fn endpoint_uri(&self, address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            return address.to_string();
        }
        match self {
            ClientTransport::Plain => format!("http://{address}"),
            ClientTransport::Tls(_) => format!("https://{address}"),
        }
    }

    pub fn configure(&self, endpoint: Endpoint) -> Result<Endpoint, FederationError> {
        match self {
            ClientTransport::Plain => Ok(endpoint),
            ClientTransport::Tls(cfg) => endpoint
                .tls_config(cfg.clone())
                .map_err(|e| FederationError::Configuration(format!("client tls: {e}"))),
        }
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, FederationError> {
    fs::read(path).map_err(|e| FederationError::Configuration(format!("cannot read {what} {}: {e}", path.display())))
}

fn check_certs(pem: &[u8], path: &Path) -> Result<(), FederationError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FederationError::Configuration(format!("invalid certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(FederationError::Configuration(format!("no certificate found in {}", path.display())));
    }
    Ok(())
}

fn check_key(pem: &[u8], path: &Path) -> Result<(), FederationError> {
    match rustls_pemfile::private_key(&mut &pem[..]) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(FederationError::Configuration(format!("no private key found in {}", path.display()))),
        Err(e) => Err(FederationError::Configuration(format!("invalid private key {}: {e}", path.display()))),
    }
}

fn load_ca(path: &Path) -> Result<Certificate, FederationError> {
    let pem = read_pem(path, "CA certificate")?;
    check_certs(&pem, path)?;
    Ok(Certificate::from_pem(pem))
}

fn load_identity(cert: &Path, key: &Path) -> Result<Identity, FederationError> {
    let cert_pem = read_pem(cert, "certificate")?;
    check_certs(&cert_pem, cert)?;
    let key_pem = read_pem(key, "private key")?;
    check_key(&key_pem, key)?;
    Ok(Identity::from_pem(cert_pem, key_pem))
}

fn rcgen_err(e: impl std::fmt::Display) -> FederationError {
    FederationError::Configuration(format!("certificate generation failed: {e}"))
}

/// Writes `ca.crt`, `server.{crt,key}` and `client.{crt,key}` into `dir`.
pub fn generate_dev_certificates(dir: &Path, server_name: &str) -> Result<(), FederationError> {
    warn!(dir = %dir.display(), "generating_development_certificates");
    create_private_dir(dir)?;

    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.distinguished_name.push(DnType::CommonName, "fedlink development CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = RcgenCert::from_params(ca_params).map_err(rcgen_err)?;
    write_file(&dir.join("ca.crt"), ca.serialize_pem().map_err(rcgen_err)?.as_bytes(), false)?;

    let mut names = vec![server_name.to_string()];
    if server_name != "localhost" {
        names.push("localhost".into());
    }
    let mut server_params = CertificateParams::new(names);
    server_params.distinguished_name.push(DnType::CommonName, server_name);
    server_params.subject_alt_names.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server = RcgenCert::from_params(server_params).map_err(rcgen_err)?;
    write_file(&dir.join("server.crt"), server.serialize_pem_with_signer(&ca).map_err(rcgen_err)?.as_bytes(), false)?;
    write_file(&dir.join("server.key"), server.serialize_private_key_pem().as_bytes(), true)?;

    let mut client_params = CertificateParams::new(vec!["fedlink-collaborator".to_string()]);
    client_params.distinguished_name.push(DnType::CommonName, "fedlink-collaborator");
    client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let client = RcgenCert::from_params(client_params).map_err(rcgen_err)?;
    write_file(&dir.join("client.crt"), client.serialize_pem_with_signer(&ca).map_err(rcgen_err)?.as_bytes(), false)?;
    write_file(&dir.join("client.key"), client.serialize_private_key_pem().as_bytes(), true)?;
    Ok(())
}

fn io_err(path: &Path, e: std::io::Error) -> FederationError {
    FederationError::Configuration(format!("{}: {e}", path.display()))
}

fn create_private_dir(dir: &Path) -> Result<(), FederationError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| io_err(dir, e))
}

fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<(), FederationError> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(if secret { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = secret;
    let mut file = opts.open(path).map_err(|e| io_err(path, e))?;
    file.write_all(contents).map_err(|e| io_err(path, e))
}
