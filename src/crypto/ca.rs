//! Agent identity checks against the workspace CA.
//!
//! Agents prove possession of a CA-signed UUID by sending `AgentUUID` and
//! `AgentUUIDSig` headers with every request; the signature is made with the
//! CA key at build time. The CA key type decides the verification algorithm.

use std::path::Path;

use ring::signature::{self, UnparsedPublicKey};
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION, OID_SIG_ED25519};
use x509_parser::pem::parse_x509_pem;

use crate::crypto::base64url_decode;
use crate::{C2Error, Result};

pub struct CaVerifier {
    spki: Vec<u8>,
    alg: &'static dyn signature::VerificationAlgorithm,
}

impl CaVerifier {
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)?;
        Self::from_pem(&pem)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, parsed) = parse_x509_pem(pem)
            .map_err(|e| C2Error::Crypto(format!("CA cert PEM: {e}")))?;
        let cert = parsed
            .parse_x509()
            .map_err(|e| C2Error::Crypto(format!("CA cert X.509: {e}")))?;

        let spki = cert.public_key();
        let key_oid = &spki.algorithm.algorithm;
        let alg: &'static dyn signature::VerificationAlgorithm = if *key_oid == OID_PKCS1_RSAENCRYPTION
        {
            &signature::RSA_PSS_2048_8192_SHA256
        } else if *key_oid == OID_KEY_TYPE_EC_PUBLIC_KEY {
            &signature::ECDSA_P256_SHA256_ASN1
        } else if *key_oid == OID_SIG_ED25519 {
            &signature::ED25519
        } else {
            return Err(C2Error::Crypto(format!(
                "unsupported CA key algorithm: {key_oid}"
            )));
        };

        Ok(Self {
            spki: spki.subject_public_key.data.to_vec(),
            alg,
        })
    }

    /// Verify a raw signature over `message` made with the CA key.
    pub fn verify(&self, message: &[u8], sig: &[u8]) -> bool {
        UnparsedPublicKey::new(self.alg, &self.spki)
            .verify(message, sig)
            .is_ok()
    }

    /// Verify the `AgentUUID` / `AgentUUIDSig` header pair.
    pub fn verify_agent_uuid(&self, uuid: &str, sig_b64url: &str) -> Result<()> {
        let sig = base64url_decode(sig_b64url)?;
        if self.verify(uuid.as_bytes(), &sig) {
            Ok(())
        } else {
            Err(C2Error::Crypto("invalid agent UUID signature".to_string()))
        }
    }
}

/// Check that `leaf_pem` was issued (and signed) by `ca_pem`.
pub fn verify_leaf(ca_pem: &[u8], leaf_pem: &[u8]) -> Result<()> {
    let (_, ca) = parse_x509_pem(ca_pem).map_err(|e| C2Error::Crypto(format!("CA PEM: {e}")))?;
    let ca_cert = ca
        .parse_x509()
        .map_err(|e| C2Error::Crypto(format!("CA X.509: {e}")))?;

    let (_, leaf) =
        parse_x509_pem(leaf_pem).map_err(|e| C2Error::Crypto(format!("leaf PEM: {e}")))?;
    let leaf_cert = leaf
        .parse_x509()
        .map_err(|e| C2Error::Crypto(format!("leaf X.509: {e}")))?;

    if leaf_cert.issuer() != ca_cert.subject() {
        return Err(C2Error::Crypto("leaf issuer does not match CA".to_string()));
    }
    leaf_cert
        .verify_signature(Some(ca_cert.public_key()))
        .map_err(|e| C2Error::Crypto(format!("leaf signature: {e}")))
}
