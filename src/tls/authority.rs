//! Self-managed certificate authority.
//!
//! Provides:
//! - [`CertificateAuthority::ensure`]: load the persisted chain or generate a fresh one
//! - [`CertificateAuthority::generate`]: build a root plus client/server leaves in memory
//! - [`load_certs`] / [`load_private_key`]: PEM file loading for the TLS listener
//!
//! # File layout
//!
//! Six PEM files live under the configured certificate directory:
//! `ca.pem`, `ca-key.pem`, `client.pem`, `client-key.pem`, `server.pem`,
//! `server-key.pem`. Leaves are always signed by the root stored next to
//! them: if any file is missing, the whole set is regenerated.
//!
//! An advisory lock on `.lock` in the same directory serializes processes
//! that check or regenerate the set.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    string::Ia5String, IsCa, Issuer, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info};

use crate::{Error, Result};

/// Organization placed in every subject generated by the gateway
pub const ORGANIZATION: &str = "rune-gateway";

/// DNS alias included in every leaf certificate
pub const HOSTNAME_ALIAS: &str = "rune-gateway";

/// Validity window of the whole chain
pub const VALIDITY_DAYS: i64 = 3650;

/// Advisory lock file held while the set is checked or regenerated
pub const LOCK_FILE: &str = ".lock";

/// Root certificate file name
pub const CA_CERT: &str = "ca.pem";
/// Root key file name
pub const CA_KEY: &str = "ca-key.pem";
/// Client certificate file name
pub const CLIENT_CERT: &str = "client.pem";
/// Client key file name
pub const CLIENT_KEY: &str = "client-key.pem";
/// Server certificate file name
pub const SERVER_CERT: &str = "server.pem";
/// Server key file name
pub const SERVER_KEY: &str = "server-key.pem";

/// All six artifacts, in write order
pub const ALL_FILES: [&str; 6] = [CA_CERT, CA_KEY, CLIENT_CERT, CLIENT_KEY, SERVER_CERT, SERVER_KEY];

/// Certificate and key pair in PEM format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// The full chain: root authority plus the client and server leaves it signed.
#[derive(Debug, Clone)]
pub struct CertificateSet {
    /// Self-signed root
    pub root: PemPair,
    /// Client leaf
    pub client: PemPair,
    /// Server leaf, presented by the TLS listener
    pub server: PemPair,
    /// Directory the set lives in
    pub dir: PathBuf,
    /// Whether this call generated the set (as opposed to loading it)
    pub generated: bool,
}

impl CertificateSet {
    /// Path of the server certificate
    #[must_use]
    pub fn server_cert_path(&self) -> PathBuf {
        self.dir.join(SERVER_CERT)
    }

    /// Path of the server key
    #[must_use]
    pub fn server_key_path(&self) -> PathBuf {
        self.dir.join(SERVER_KEY)
    }

    /// Path of the root certificate clients should trust
    #[must_use]
    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT)
    }
}

/// Certificate authority backed by `rcgen`.
pub struct CertificateAuthority;

impl CertificateAuthority {
    /// Load the certificate set from `dir`, generating and persisting a fresh
    /// chain when any of the six files is absent.
    ///
    /// Calling this twice on a complete directory leaves every file
    /// byte-identical.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] on any filesystem or cryptographic
    /// failure. The gateway cannot serve HTTPS without this material.
    pub fn ensure(dir: &Path, host: &str) -> Result<CertificateSet> {
        let _lock = lock_dir(dir)?;

        let missing: Vec<&str> = ALL_FILES
            .iter()
            .copied()
            .filter(|name| !dir.join(name).is_file())
            .collect();

        if missing.is_empty() {
            debug!(dir = %dir.display(), "Loading existing certificate set");
            return Self::load(dir);
        }

        info!(
            dir = %dir.display(),
            missing = ?missing,
            "Certificate not found. Generating a new certificate chain"
        );
        let mut set = Self::generate(host)?;
        set.dir = dir.to_path_buf();
        Self::persist(&set)?;
        Ok(set)
    }

    /// Generate a root authority and client/server leaves for `host`.
    ///
    /// The returned set has an empty `dir` until persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or signing fails, or if `host` is
    /// not usable as a subject alternative name.
    pub fn generate(host: &str) -> Result<CertificateSet> {
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Certificate(format!("Failed to generate root key: {e}")))?;

        let mut root_params = CertificateParams::default();
        root_params.distinguished_name = subject(&format!("{ORGANIZATION} Root CA"));
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = validity_window()?;
        root_params.not_before = not_before;
        root_params.not_after = not_after;

        let root_cert = root_params
            .self_signed(&root_key)
            .map_err(|e| Error::Certificate(format!("Root cert generation failed: {e}")))?;
        let root = PemPair {
            cert_pem: root_cert.pem(),
            key_pem: root_key.serialize_pem(),
        };

        let issuer = Issuer::new(root_params, root_key);
        let client = issue_leaf(&issuer, "client", host, (not_before, not_after))?;
        let server = issue_leaf(&issuer, "server", host, (not_before, not_after))?;

        Ok(CertificateSet {
            root,
            client,
            server,
            dir: PathBuf::new(),
            generated: true,
        })
    }

    /// Read all six files from `dir` and check they are well-formed PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or does not contain the
    /// expected certificate or key.
    pub fn load(dir: &Path) -> Result<CertificateSet> {
        let read_pair = |cert: &str, key: &str| -> Result<PemPair> {
            let pair = PemPair {
                cert_pem: read_to_string(&dir.join(cert))?,
                key_pem: read_to_string(&dir.join(key))?,
            };
            check_certificate(&pair.cert_pem, cert)?;
            PrivateKeyDer::from_pem_slice(pair.key_pem.as_bytes())
                .map_err(|e| Error::Certificate(format!("Invalid private key in '{key}': {e}")))?;
            Ok(pair)
        };

        Ok(CertificateSet {
            root: read_pair(CA_CERT, CA_KEY)?,
            client: read_pair(CLIENT_CERT, CLIENT_KEY)?,
            server: read_pair(SERVER_CERT, SERVER_KEY)?,
            dir: dir.to_path_buf(),
            generated: false,
        })
    }

    /// Write the six artifacts of `set` into `set.dir`, replacing prior
    /// content one file at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a file cannot
    /// be written.
    pub fn persist(set: &CertificateSet) -> Result<()> {
        fs::create_dir_all(&set.dir).map_err(|e| {
            Error::Certificate(format!("Cannot create dir '{}': {e}", set.dir.display()))
        })?;

        let contents = [
            (CA_CERT, &set.root.cert_pem, false),
            (CA_KEY, &set.root.key_pem, true),
            (CLIENT_CERT, &set.client.cert_pem, false),
            (CLIENT_KEY, &set.client.key_pem, true),
            (SERVER_CERT, &set.server.cert_pem, false),
            (SERVER_KEY, &set.server.key_pem, true),
        ];
        for (name, pem, secret) in contents {
            write_atomic(&set.dir.join(name), pem.as_bytes(), secret)?;
        }

        debug!(dir = %set.dir.display(), "Certificate set written");
        Ok(())
    }
}

/// Take the exclusive advisory lock on `dir`, creating it if needed.
///
/// Released when the returned file is dropped.
fn lock_dir(dir: &Path) -> Result<File> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::Certificate(format!("Cannot create dir '{}': {e}", dir.display())))?;

    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| Error::Certificate(format!("Cannot open '{}': {e}", path.display())))?;
    file.lock_exclusive()
        .map_err(|e| Error::Certificate(format!("Cannot lock '{}': {e}", path.display())))?;
    Ok(file)
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Certificate(format!("Cannot read '{}': {e}", path.display())))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Certificate(format!("Failed to parse certs from '{}': {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| {
        Error::Certificate(format!(
            "Failed to load private key from '{}': {e}",
            path.display()
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Issue a leaf signed by `issuer`, valid for the alias, `localhost` and `host`.
fn issue_leaf(
    issuer: &Issuer<'_, KeyPair>,
    role: &str,
    host: &str,
    (not_before, not_after): (time::OffsetDateTime, time::OffsetDateTime),
) -> Result<PemPair> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("Failed to generate {role} key: {e}")))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject(&format!("{ORGANIZATION} {role}"));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = subject_alt_names(host)?;
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params
        .signed_by(&key, issuer)
        .map_err(|e| Error::Certificate(format!("{role} cert signing failed: {e}")))?;

    Ok(PemPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn subject_alt_names(host: &str) -> Result<Vec<SanType>> {
    let dns = |name: &str| -> Result<SanType> {
        Ia5String::try_from(name)
            .map(SanType::DnsName)
            .map_err(|e| Error::Certificate(format!("Invalid DNS SAN '{name}': {e}")))
    };

    let mut sans = vec![dns(HOSTNAME_ALIAS)?, dns("localhost")?];
    match host.parse::<IpAddr>() {
        Ok(ip) => sans.push(SanType::IpAddress(ip)),
        Err(_) if host != "localhost" && host != HOSTNAME_ALIAS => sans.push(dns(host)?),
        Err(_) => {}
    }
    Ok(sans)
}

fn check_certificate(pem: &str, name: &str) -> Result<()> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("Invalid PEM in '{name}': {e}")))?;
    parsed
        .parse_x509()
        .map_err(|e| Error::Certificate(format!("Invalid certificate in '{name}': {e}")))?;
    Ok(())
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Certificate(format!("Cannot read '{}': {e}", path.display())))
}

/// Write via a sibling temp file and rename so readers never see a torn file.
fn write_atomic(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    let tmp = path.with_extension("pem.tmp");
    let map_err = |e: std::io::Error| {
        Error::Certificate(format!("Cannot write '{}': {e}", path.display()))
    };

    let mut file = fs::File::create(&tmp).map_err(map_err)?;
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(map_err)?;
    }
    #[cfg(not(unix))]
    let _ = secret;
    file.write_all(contents).map_err(map_err)?;
    file.sync_all().map_err(map_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(map_err)
}

/// `(now, now + VALIDITY_DAYS)` as `OffsetDateTime`s for `rcgen`.
fn validity_window() -> Result<(time::OffsetDateTime, time::OffsetDateTime)> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Certificate(format!("System time error: {e}")))?
        .as_secs();
    let now = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(now_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Certificate(format!("Date calculation error: {e}")))?;

    let not_after = now
        .checked_add(time::Duration::days(VALIDITY_DAYS))
        .ok_or_else(|| Error::Certificate("Validity window overflows".to_string()))?;
    Ok((now, not_after))
}
