use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
// Cache files and key material rely on Unix permission bits.
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rand::{RngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SerialNumber,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::info;
use zeroize::Zeroizing;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_VALIDITY_YEARS: i64 = 30;
const CA_ORGANIZATION: &str = "gitmproxy";
const CA_COMMON_NAME: &str = "Gopher in the middle Root CA";

/// The proxy's self-signed root certificate authority. Clients that trust
/// `ca.crt` accept the leaf certificates minted on the fly for intercepted
/// hosts.
pub struct CertificateAuthority {
    root_cert: Arc<Vec<u8>>,
    root_key: Arc<KeyPair>,
    root_params: Arc<CertificateParams>,
}

impl CertificateAuthority {
    /// Loads `ca.crt`/`ca.key` from `dir`, generating a fresh pair when
    /// neither exists. Finding only one of the two is a startup-fatal
    /// inconsistency.
    pub fn load_or_generate<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create CA directory {}", dir.display()))?;

        let paths = CaPaths::new(dir);
        match (paths.cert.exists(), paths.key.exists()) {
            (false, false) => Self::generate(&paths),
            (true, true) => Self::load_existing(&paths),
            _ => bail!(
                "incomplete CA material in {}; expected both {} and {}",
                dir.display(),
                CA_CERT_FILE,
                CA_KEY_FILE
            ),
        }
    }

    fn generate(paths: &CaPaths) -> Result<Self> {
        info!("generating new CA certificate and key");
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate CA key: {err}"))?;
        let root_params = build_root_params();
        let root_cert = root_params
            .self_signed(&root_key)
            .map_err(|err| anyhow!("failed to self-sign CA certificate: {err}"))?;

        let cert_pem = root_cert.pem();
        let key_pem = Zeroizing::new(root_key.serialize_pem());
        write_pem_file(&paths.cert, &cert_pem, false)?;
        write_pem_file(&paths.key, key_pem.as_str(), true)?;

        info!(
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            "CA certificate and key generated"
        );
        Ok(Self {
            root_cert: Arc::new(root_cert.der().as_ref().to_vec()),
            root_key: Arc::new(root_key),
            root_params: Arc::new(root_params),
        })
    }

    fn load_existing(paths: &CaPaths) -> Result<Self> {
        let root_der = read_certificate_der(&paths.cert)?;
        let key_pem = Zeroizing::new(fs::read_to_string(&paths.key).with_context(|| {
            format!("failed to read CA key from {}", paths.key.display())
        })?);
        let root_key = KeyPair::from_pem(key_pem.as_ref())
            .map_err(|err| anyhow!("failed to parse CA key: {err}"))?;
        ensure_key_matches_cert(&root_der, &root_key)?;

        info!(cert = %paths.cert.display(), "loaded existing CA material");
        Ok(Self {
            root_cert: Arc::new(root_der),
            root_key: Arc::new(root_key),
            root_params: Arc::new(build_root_params()),
        })
    }

    pub fn root_certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.root_cert.as_ref().clone())
    }

    /// Mints a leaf certificate covering `names`, chained to the root, ready
    /// for use as a rustls server identity.
    pub fn mint_leaf(&self, names: &[&str], ttl: StdDuration) -> Result<Arc<CertifiedKey>> {
        ensure!(!names.is_empty(), "at least one subject name is required");
        ensure!(ttl > StdDuration::ZERO, "leaf ttl must be positive");

        let leaf_params = build_leaf_params(names, ttl)?;
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate leaf key: {err}"))?;
        let issuer = rcgen::Issuer::from_params(self.root_params.as_ref(), &*self.root_key);
        let leaf_cert = sign_certificate(&leaf_params, &leaf_key, &issuer)?;

        let private_key_der = Zeroizing::new(leaf_key.serialize_der());
        let key_der = PrivateKeyDer::try_from(private_key_der.to_vec())
            .map_err(|err| anyhow!("failed to parse generated leaf key: {err}"))?;

        let chain = vec![
            CertificateDer::from(leaf_cert.der().as_ref().to_vec()),
            self.root_certificate_der(),
        ];
        let provider = ring::default_provider();
        let certified = CertifiedKey::from_der(chain, key_der, &provider)
            .map_err(|err| anyhow!("failed to build certified key: {err}"))?;
        Ok(Arc::new(certified))
    }
}

fn build_root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_YEARS * 365);
    params
}

fn build_leaf_params(names: &[&str], ttl: StdDuration) -> Result<CertificateParams> {
    let subject_alt_names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let mut params = CertificateParams::new(subject_alt_names)
        .map_err(|err| anyhow!("invalid subject names: {err}"))?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    if let Some(primary) = names.first() {
        dn.push(DnType::CommonName, *primary);
    }
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    let ttl_secs: i64 = ttl
        .as_secs()
        .try_into()
        .map_err(|_| anyhow!("leaf TTL exceeds supported range"))?;
    params.not_after = now + Duration::seconds(ttl_secs);
    Ok(params)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Serial numbers must be positive and non-zero.
    bytes[0] &= 0x7F;
    if bytes.iter().all(|byte| *byte == 0) {
        bytes[bytes.len() - 1] = 1;
    }
    SerialNumber::from(bytes.to_vec())
}

fn write_pem_file(path: &Path, contents: &str, private: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    let mode = if private { 0o600 } else { 0o644 };
    options.mode(mode);
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn read_certificate_der(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read certificate {}", path.display()))?;
    let mut cursor = Cursor::new(bytes);
    let mut certs = rustls_pemfile::certs(&mut cursor);
    match certs.next() {
        Some(Ok(cert)) => {
            if certs.next().is_some() {
                bail!(
                    "multiple certificates found in {}; expected a single PEM section",
                    path.display()
                );
            }
            Ok(cert.as_ref().to_vec())
        }
        Some(Err(err)) => {
            Err(err).with_context(|| format!("failed to parse certificate at {}", path.display()))
        }
        None => bail!("no certificate found in {}", path.display()),
    }
}

fn ensure_key_matches_cert(cert_der: &[u8], key: &KeyPair) -> Result<()> {
    let provider = ring::default_provider();
    let key_der = PrivateKeyDer::try_from(key.serialize_der())
        .map_err(|err| anyhow!("failed to parse private key DER: {err}"))?;
    let cert = CertificateDer::from(cert_der.to_vec());
    CertifiedKey::from_der(vec![cert], key_der, &provider)
        .map_err(|err| anyhow!("CA key does not match certificate: {err}"))?;
    Ok(())
}

fn sign_certificate(
    params: &CertificateParams,
    subject_key: &KeyPair,
    issuer: &rcgen::Issuer<'_, impl rcgen::SigningKey>,
) -> Result<Certificate> {
    params
        .signed_by(subject_key, issuer)
        .map_err(|err| anyhow!("failed to sign certificate: {err}"))
}

struct CaPaths {
    cert: PathBuf,
    key: PathBuf,
}

impl CaPaths {
    fn new(dir: &Path) -> Self {
        Self {
            cert: dir.join(CA_CERT_FILE),
            key: dir.join(CA_KEY_FILE),
        }
    }
}
