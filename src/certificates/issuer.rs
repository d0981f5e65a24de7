//! # Certificate Issuer
//!
//! Issues the self-signed webhook CA and the serving certificate it signs.
//!
//! Private keys come from the [`KeyPool`] when one is configured and has a key
//! buffered. Otherwise a key is generated on the spot, retrying a few times
//! before giving up.

use crate::constants::{KEY_RETRY_COUNT, KEY_RETRY_INTERVAL};
use crate::keypool::{KeyGenerator, KeyPool, KeyPoolError, PrivateKey, RsaKeyGenerator};
use chrono::{DateTime, Months, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509NameRef, X509};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Certificate issuance errors
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("failed to obtain a private key after {attempts} attempts: {source}")]
    KeyGeneration {
        attempts: u32,
        #[source]
        source: KeyPoolError,
    },

    #[error("failed to build certificate: {0}")]
    Signing(#[from] ErrorStack),

    #[error("invalid validity: {0}")]
    InvalidValidity(String),

    #[error("issuer {expected} does not match CA subject {actual}")]
    IssuerMismatch { expected: String, actual: String },
}

/// A signed certificate with its private key, parsed and PEM encoded
pub struct IssuedCertificate {
    pub certificate: X509,
    pub private_key: PrivateKey,
    pub certificate_pem: Vec<u8>,
    /// PKCS#8 PEM, wiped on drop
    pub private_key_pem: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("subject", &common_name(self.certificate.subject_name()))
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    fn new(certificate: X509, private_key: PrivateKey) -> Result<Self, IssuanceError> {
        let certificate_pem = certificate.to_pem()?;
        let private_key_pem = Zeroizing::new(private_key.private_key_to_pem_pkcs8()?);
        Ok(Self {
            certificate,
            private_key,
            certificate_pem,
            private_key_pem,
        })
    }
}

/// Issues CA and leaf certificates
#[derive(Clone)]
pub struct CertificateIssuer {
    key_pool: Option<Arc<KeyPool>>,
    generator: Arc<dyn KeyGenerator>,
    retry_count: u32,
    retry_interval: Duration,
}

impl std::fmt::Debug for CertificateIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateIssuer")
            .field("key_pool", &self.key_pool)
            .field("retry_count", &self.retry_count)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl Default for CertificateIssuer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CertificateIssuer {
    #[must_use]
    pub fn new(key_pool: Option<Arc<KeyPool>>) -> Self {
        Self {
            key_pool,
            generator: Arc::new(RsaKeyGenerator::default()),
            retry_count: KEY_RETRY_COUNT,
            retry_interval: KEY_RETRY_INTERVAL,
        }
    }

    /// Generator used when there is no key pool
    #[must_use]
    pub fn with_generator(mut self, generator: impl KeyGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    /// Issue a self-signed CA certificate valid for `validity_years` from `not_before`
    pub async fn issue_self_signed_ca(
        &self,
        common_name: &str,
        not_before: DateTime<Utc>,
        validity_years: u32,
    ) -> Result<IssuedCertificate, IssuanceError> {
        let not_after = validity_end(not_before, validity_years)?;
        let key = self.private_key().await?;
        let name = subject_name(common_name)?;

        let mut builder = certificate_builder(&key, not_before, not_after)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .key_cert_sign()
                .build()?,
        )?;
        let san = SubjectAlternativeName::new()
            .dns(common_name)
            .build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&key, MessageDigest::sha256())?;

        debug!("Issued CA certificate {} valid until {}", common_name, not_after);
        IssuedCertificate::new(builder.build(), key)
    }

    /// Issue a serving certificate for `subject_cn` signed by the given CA
    ///
    /// `issuer_cn` must match the common name of the CA subject.
    pub async fn issue_leaf_certificate(
        &self,
        subject_cn: &str,
        issuer_cn: &str,
        not_before: DateTime<Utc>,
        validity_years: u32,
        ca_cert: &X509,
        ca_key: &PrivateKey,
    ) -> Result<IssuedCertificate, IssuanceError> {
        let ca_subject = common_name(ca_cert.subject_name()).unwrap_or_default();
        if ca_subject != issuer_cn {
            return Err(IssuanceError::IssuerMismatch {
                expected: issuer_cn.to_string(),
                actual: ca_subject,
            });
        }
        let not_after = validity_end(not_before, validity_years)?;
        let key = self.private_key().await?;

        let mut builder = certificate_builder(&key, not_before, not_after)?;
        let subject = subject_name(subject_cn)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(ca_cert.subject_name())?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().server_auth().build()?)?;
        let san = SubjectAlternativeName::new()
            .dns(subject_cn)
            .build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(san)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(aki)?;
        builder.sign(ca_key, MessageDigest::sha256())?;

        debug!("Issued certificate {} valid until {}", subject_cn, not_after);
        IssuedCertificate::new(builder.build(), key)
    }

    /// Take a key from the pool or generate one
    async fn private_key(&self) -> Result<PrivateKey, IssuanceError> {
        if let Some(pool) = &self.key_pool {
            match pool.get_key() {
                Ok(key) => return Ok(key),
                Err(e) => debug!("No pooled key available ({}), generating one", e),
            }
        }

        let mut last_error = KeyPoolError::EmptyPool;
        for attempt in 1..=self.retry_count {
            match self.generate_key().await {
                Ok(key) => return Ok(key),
                Err(e) => {
                    warn!(
                        "Private key generation attempt {}/{} failed: {}",
                        attempt, self.retry_count, e
                    );
                    last_error = e;
                }
            }
            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        Err(IssuanceError::KeyGeneration {
            attempts: self.retry_count,
            source: last_error,
        })
    }

    async fn generate_key(&self) -> Result<PrivateKey, KeyPoolError> {
        if let Some(pool) = &self.key_pool {
            return pool.generate_single_key().await;
        }
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || generator.generate())
            .await
            .map_err(KeyPoolError::generation)?
    }
}

/// `not_before` plus `years` calendar years
fn validity_end(not_before: DateTime<Utc>, years: u32) -> Result<DateTime<Utc>, IssuanceError> {
    if years == 0 {
        return Err(IssuanceError::InvalidValidity(
            "validity must be at least one year".to_string(),
        ));
    }
    years
        .checked_mul(12)
        .and_then(|months| not_before.checked_add_months(Months::new(months)))
        .ok_or_else(|| {
            IssuanceError::InvalidValidity(format!("{years} years from {not_before} overflows"))
        })
}

fn subject_name(common_name: &str) -> Result<openssl::x509::X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

/// v3 builder with a random 128-bit serial, the public key and the validity set
fn certificate_builder(
    key: &PrivateKey,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<X509Builder, IssuanceError> {
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    let not_before = asn1_time(not_before)?;
    let not_after = asn1_time(not_after)?;
    builder.set_serial_number(&serial)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

fn asn1_time(time: DateTime<Utc>) -> Result<Asn1Time, IssuanceError> {
    let seconds = time.timestamp().try_into().map_err(|e| {
        IssuanceError::InvalidValidity(format!("{time} cannot be encoded: {e}"))
    })?;
    Ok(Asn1Time::from_unix(seconds)?)
}
