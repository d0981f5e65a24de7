//! # Certificates
//!
//! Issuance of the webhook CA and serving certificate ([`issuer`]) and
//! inspection of stored PEM certificates.
//!
//! A stored serving certificate is due for rotation when it expires less than
//! one calendar month from now.

use crate::constants::ROTATION_LEAD_MONTHS;
use chrono::{DateTime, Months, Utc};
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

pub mod issuer;

pub use issuer::{CertificateIssuer, IssuanceError, IssuedCertificate};

/// Errors reading a stored certificate
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate is empty")]
    Empty,

    #[error("failed to decode PEM block: {0}")]
    Pem(String),

    #[error("failed to parse certificate: {0}")]
    X509(String),

    #[error("certificate validity is out of range")]
    Validity,
}

/// Validity end of a PEM certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateExpiry {
    pub not_after: DateTime<Utc>,
    /// Non-whitespace bytes left after the first PEM block
    pub trailing_bytes: usize,
}

/// Decode the first PEM block of `pem` and read its `notAfter`
pub fn parse_expiry(pem: &[u8]) -> Result<CertificateExpiry, CertificateError> {
    if pem.iter().all(u8::is_ascii_whitespace) {
        return Err(CertificateError::Empty);
    }
    let (rest, block) = parse_x509_pem(pem).map_err(|e| CertificateError::Pem(e.to_string()))?;
    let certificate = block
        .parse_x509()
        .map_err(|e| CertificateError::X509(e.to_string()))?;
    let not_after = DateTime::from_timestamp(certificate.validity().not_after.timestamp(), 0)
        .ok_or(CertificateError::Validity)?;
    let trailing_bytes = rest.iter().filter(|b| !b.is_ascii_whitespace()).count();
    Ok(CertificateExpiry {
        not_after,
        trailing_bytes,
    })
}

/// Whether a certificate expiring at `not_after` must be replaced at `now`
#[must_use]
pub fn rotation_due(not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.checked_add_months(Months::new(ROTATION_LEAD_MONTHS))
        .is_none_or(|threshold| not_after < threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};

    fn self_signed_pem(not_after: DateTime<Utc>) -> Vec<u8> {
        let key = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "expiry-test").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(not_after.timestamp() - 3600).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after.timestamp()).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build().to_pem().unwrap()
    }

    #[test]
    fn test_rotation_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        // Calendar month, clamped to the end of February
        let threshold = Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap();

        assert!(rotation_due(threshold - chrono::Duration::seconds(1), now));
        assert!(!rotation_due(threshold, now));
        assert!(!rotation_due(threshold + chrono::Duration::days(365), now));
        assert!(rotation_due(now - chrono::Duration::days(1), now));
    }

    #[test]
    fn test_parse_expiry() {
        let not_after = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        let pem = self_signed_pem(not_after);

        let expiry = parse_expiry(&pem).unwrap();
        assert_eq!(expiry.not_after, not_after);
        assert_eq!(expiry.trailing_bytes, 0);
    }

    #[test]
    fn test_parse_expiry_counts_trailing_bytes() {
        let not_after = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        let mut pem = self_signed_pem(not_after);
        pem.extend_from_slice(b"garbage\n");

        let expiry = parse_expiry(&pem).unwrap();
        assert_eq!(expiry.not_after, not_after);
        assert_eq!(expiry.trailing_bytes, 7);
    }

    #[test]
    fn test_parse_expiry_rejects_bad_input() {
        assert!(matches!(parse_expiry(b""), Err(CertificateError::Empty)));
        assert!(matches!(parse_expiry(b"\n  \n"), Err(CertificateError::Empty)));
        assert!(parse_expiry(b"not a certificate").is_err());
        assert!(matches!(
            parse_expiry(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(CertificateError::X509(_))
        ));
    }
}
