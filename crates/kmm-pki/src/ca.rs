//! Certificate authority operations
//!
//! A CA is held as a pair of PEM strings. rcgen's `KeyPair` is not `Clone`,
//! so the signing key is re-parsed from PEM whenever a leaf is issued.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::{parse_pem, PkiError, Result};

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Compute (not_before, not_after) starting now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// What a leaf certificate is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertUsage {
    /// TLS server
    Server,
    /// TLS client
    Client,
}

/// Parameters of a leaf certificate issued by a [`CertificateAuthority`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertSpec {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations (Kubernetes groups for client certs)
    pub organizations: Vec<String>,
    /// DNS names and IP addresses
    pub sans: Vec<String>,
    /// Extended key usage
    pub usage: CertUsage,
}

impl CertSpec {
    /// A server certificate for `common_name` with the given SANs
    pub fn server(common_name: impl Into<String>, sans: Vec<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizations: Vec::new(),
            sans,
            usage: CertUsage::Server,
        }
    }

    /// A client certificate for `common_name`
    pub fn client(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizations: Vec::new(),
            sans: Vec::new(),
            usage: CertUsage::Client,
        }
    }

    /// Add a subject organization
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organizations.push(organization.into());
        self
    }
}

/// A certificate authority held as PEM
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a CA from PEM, validating both halves parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// CA certificate PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key PEM
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a leaf certificate, returning `(cert_pem, key_pem)`
    pub fn issue(&self, spec: &CertSpec) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(spec.common_name.clone()),
        );
        for org in &spec.organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match spec.usage {
            CertUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = spec
            .sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate key for {}: {}",
                spec.common_name, e
            ))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                spec.common_name, e
            ))
        })?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }
}

/// Generate a standalone key pair, returning `(private_pem, public_pem)`
///
/// Used for the service-account signing key, which has no certificate.
pub fn generate_key_pair() -> Result<(String, String)> {
    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate key pair: {}", e))
    })?;
    Ok((key_pair.serialize_pem(), key_pair.public_key_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    fn parse(cert_pem: &str) -> Vec<u8> {
        parse_pem(cert_pem).unwrap()
    }

    #[test]
    fn ca_can_be_created() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        assert_eq!(loaded.cert_pem(), ca.cert_pem());
    }

    #[test]
    fn corrupted_ca_key_is_rejected() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let err = CertificateAuthority::from_pem(ca.cert_pem(), "garbage").unwrap_err();
        assert!(matches!(err, PkiError::ParseError(_)));
    }

    #[test]
    fn issued_server_cert_is_signed_by_ca_and_carries_sans() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let spec = CertSpec::server(
            "kube-apiserver",
            vec!["kubernetes.default".to_string(), "10.96.0.1".to_string()],
        );
        let (cert_pem, key_pem) = ca.issue(&spec).unwrap();
        assert!(key_pem.contains("PRIVATE KEY"));

        let der = parse(&cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let ca_der = parse(ca.cert_pem());
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "kube-apiserver");

        let sans = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(sans.value.general_names.len(), 2);
    }

    #[test]
    fn client_cert_carries_organization() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let spec = CertSpec::client("kubernetes-admin").with_organization("system:masters");
        let (cert_pem, _) = ca.issue(&spec).unwrap();

        let der = parse(&cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let org = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap();
        assert_eq!(org, "system:masters");
    }

    #[test]
    fn invalid_dns_san_is_rejected() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let spec = CertSpec::server("bad", vec!["naïve.example".to_string()]);
        let err = ca.issue(&spec).unwrap_err();
        assert!(matches!(err, PkiError::CertificateGenerationFailed(_)));
    }

    #[test]
    fn key_pair_has_matching_public_half() {
        let (private_pem, public_pem) = generate_key_pair().unwrap();
        assert!(private_pem.contains("PRIVATE KEY"));
        assert!(public_pem.contains("BEGIN PUBLIC KEY"));
    }
}
