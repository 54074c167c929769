use std::env;

use base64::{Engine, prelude::BASE64_STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(
        "signature secret key not found. You must specify a secret key in the \
         TURBO_REMOTE_CACHE_SIGNATURE_KEY environment variable"
    )]
    NoSignatureSecretKey,
    #[error("base64 encoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Signs uploaded artifacts and verifies downloaded ones with an
/// HMAC-SHA256 tag over `hash ++ team_id ++ body` under a shared secret.
#[derive(Debug)]
pub struct ArtifactSignatureAuthenticator {
    team_id: Vec<u8>,
    // Lets tests avoid racing on the process environment.
    secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: Vec<u8>, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(key) = &self.secret_key_override {
            return Ok(key.clone());
        }
        env::var("TURBO_REMOTE_CACHE_SIGNATURE_KEY")
            .map(String::into_bytes)
            .map_err(|_| SignatureError::NoSignatureSecretKey)
    }

    fn keyed_mac(&self, hash: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(hash);
        mac.update(&self.team_id);
        Ok(mac)
    }

    pub fn generate_tag(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mut mac = self.keyed_mac(hash)?;
        mac.update(artifact_body);
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn validate(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let mut mac = self.keyed_mac(hash)?;
        mac.update(artifact_body);
        let expected = BASE64_STANDARD.decode(expected_tag)?;
        Ok(mac.verify_slice(&expected).is_ok())
    }
}
