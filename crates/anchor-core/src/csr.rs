//! PKCS#10 certificate signing requests
//!
//! The registrar announces a fresh public key to the key service with a
//! CSR whose common name is the identity's UUID string. Country and
//! organization come from the configuration.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair as RcgenKeyPair};
use uuid::Uuid;

use crate::crypto::KeyPair;
use crate::error::{ProtocolError, Result};

/// Build a DER-encoded PKCS#10 CSR for the given identity key
pub fn build_csr(key: &KeyPair, country: &str, organization: &str, uid: Uuid) -> Result<Vec<u8>> {
    let pkcs8 = key.to_pkcs8_der()?;
    let rcgen_key = RcgenKeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| ProtocolError::Csr(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, country);
    dn.push(DnType::OrganizationName, organization);
    dn.push(DnType::CommonName, uid.to_string());

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let csr = params.serialize_request(&rcgen_key)?;
    Ok(csr.der().as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_der_csr() {
        let kp = KeyPair::generate();
        let uid = Uuid::parse_str("d1b7eb09-d1d8-4c63-b6a5-1c861a6477fa").unwrap();

        let der = build_csr(&kp, "DE", "ubirch GmbH", uid).unwrap();

        // DER SEQUENCE
        assert_eq!(der[0], 0x30);
        // the subject carries the UUID string as printable bytes
        let needle = uid.to_string();
        assert!(der
            .windows(needle.len())
            .any(|w| w == needle.as_bytes()));
    }

    #[test]
    fn test_distinct_keys_produce_distinct_requests() {
        let uid = Uuid::new_v4();
        let a = build_csr(&KeyPair::generate(), "DE", "ubirch GmbH", uid).unwrap();
        let b = build_csr(&KeyPair::generate(), "DE", "ubirch GmbH", uid).unwrap();
        assert_ne!(a, b);
    }
}
