//! # Server Identity and PKI
//!
//! One 32-byte seed backs both halves of the server's identity:
//!
//! - **Signing**: the seed is an Ed25519 secret; the derived key signs the
//!   self-signed root CA and the per-server leaf certificates.
//! - **WireGuard**: the same seed, pushed through the Edwards→Montgomery
//!   birational map, is the server's Curve25519 (WireGuard) private key.
//!
//! The seed is produced by hashing 64 bytes of OS randomness onto the curve
//! (wide scalar reduction, then a fixed-base multiply); the compressed point
//! bytes are what gets persisted to `root.key`. Certificates are written as
//! PEM next to it:
//!
//! - `<data_dir>/root.key`: the 32-byte seed
//! - `<data_dir>/root.pem`: self-signed root CA (365-day validity)
//! - `<data_dir>/<server>/server.pem`: per-server leaf certificate

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use crate::keys;

/// Validity window for the root CA and every leaf certificate.
const CERT_VALIDITY_DAYS: i64 = 365;

/// Common name on the root CA.
const CA_COMMON_NAME: &str = "Wiremesh";

/// Organization on issued leaf certificates.
const ORG_NAME: &str = "Wiremesh";

/// Errors for seed handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedError {
    /// The persisted seed is not exactly 32 bytes.
    InvalidSeedSize(usize),
    /// The persisted bytes are not a valid curve point.
    InvalidPoint,
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedError::InvalidSeedSize(n) => {
                write!(f, "invalid seed size: expected 32 bytes, got {}", n)
            }
            SeedError::InvalidPoint => write!(f, "seed bytes are not a valid curve point"),
        }
    }
}

impl std::error::Error for SeedError {}

/// The server's identity seed: a point on the Edwards curve whose compressed
/// form feeds Ed25519 signing and whose Montgomery form is the WireGuard
/// private key.
#[derive(Clone)]
pub struct Seed {
    point: EdwardsPoint,
}

impl Seed {
    /// Generate a fresh seed from 64 bytes of OS randomness.
    pub fn generate() -> Self {
        let mut wide = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut wide);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        Self {
            point: EdwardsPoint::mul_base(&scalar),
        }
    }

    /// The persisted form: 32 compressed point bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.point.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SeedError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SeedError::InvalidSeedSize(bytes.len()))?;
        let point = CompressedEdwardsY(arr)
            .decompress()
            .ok_or(SeedError::InvalidPoint)?;
        Ok(Self { point })
    }

    /// The Ed25519 signing key used for all certificate issuance.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.to_bytes())
    }

    /// The WireGuard identity: the seed point in Montgomery form is the
    /// private key.
    pub fn wireguard_keypair(&self) -> keys::Keypair {
        let mont = self.point.to_montgomery().to_bytes();
        keys::Keypair::from_private_key(keys::PrivateKey::from_bytes(mont))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        fs::write(path, self.to_bytes())
            .with_context(|| format!("failed to write seed to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read seed {}", path.display()))?;
        Ok(Self::from_bytes(&bytes)?)
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seed").finish_non_exhaustive()
    }
}

/// Wrap an Ed25519 signing key as an rcgen keypair by hand-building the
/// PKCS#8 envelope (rcgen only ingests DER).
fn rcgen_keypair(signing_key: &SigningKey) -> Result<rcgen::KeyPair> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let secret = signing_key.to_bytes();
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret);

    rcgen::KeyPair::try_from(pkcs8.as_slice())
        .context("failed to build Ed25519 keypair for certificate issuance")
}

fn random_serial() -> rcgen::SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    rcgen::SerialNumber::from(bytes.to_vec())
}

fn validity_window() -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now, now + TimeDuration::days(CERT_VALIDITY_DAYS))
}

fn ca_params() -> Result<rcgen::CertificateParams> {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .context("failed to create CA certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(CA_COMMON_NAME.to_string()),
    );
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(random_serial());
    let (not_before, not_after) = validity_window();
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

fn leaf_params(server: &str) -> Result<rcgen::CertificateParams> {
    let mut params = rcgen::CertificateParams::new(vec![server.to_string()])
        .context("failed to create leaf certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(server.to_string()),
    );
    params.distinguished_name.push(
        rcgen::DnType::OrganizationName,
        rcgen::DnValue::Utf8String(ORG_NAME.to_string()),
    );
    params.serial_number = Some(random_serial());
    let (not_before, not_after) = validity_window();
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

/// Make sure the seed, root CA, and the server's leaf certificate all exist
/// under `data_dir`, generating whatever is missing. Returns the seed so the
/// caller can derive the WireGuard identity from it.
pub fn ensure_certificates(data_dir: &Path, server: &str) -> Result<Seed> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let seed_path = data_dir.join("root.key");
    let ca_path = data_dir.join("root.pem");
    let leaf_path = data_dir.join(server).join("server.pem");

    let seed = if seed_path.exists() {
        Seed::load(&seed_path)?
    } else {
        let seed = Seed::generate();
        seed.save(&seed_path)?;
        seed
    };

    let ca_key = rcgen_keypair(&seed.signing_key())?;

    let ca_cert = if ca_path.exists() {
        let pem = fs::read_to_string(&ca_path)
            .with_context(|| format!("failed to read {}", ca_path.display()))?;
        let params = rcgen::CertificateParams::from_ca_cert_pem(&pem)
            .context("failed to parse existing root CA")?;
        params
            .self_signed(&ca_key)
            .context("failed to rebuild root CA issuer")?
    } else {
        info!("generating root CA");
        let cert = ca_params()?
            .self_signed(&ca_key)
            .context("failed to self-sign root CA")?;
        fs::write(&ca_path, cert.pem())
            .with_context(|| format!("failed to write {}", ca_path.display()))?;
        cert
    };

    if !leaf_path.exists() {
        info!(server, "generating server certificate");
        if let Some(dir) = leaf_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let cert = leaf_params(server)?
            .signed_by(&ca_key, &ca_cert, &ca_key)
            .context("failed to issue server certificate")?;
        fs::write(&leaf_path, cert.pem())
            .with_context(|| format!("failed to write {}", leaf_path.display()))?;
    }

    Ok(seed)
}
