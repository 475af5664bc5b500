//! Short-lived HMAC-signed tokens scoping one upload/read to one file id.
//! The master mints these in `Assign`/`Lookup` responses; the volume
//! server verifies signature and `fid` equality before serving a write
//! (and, if configured, a read).

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CommonError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIdClaims {
    pub fid: String,
    pub exp: u64,
}

#[derive(Clone)]
pub struct JwtSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
}

impl JwtSigner {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn issue(&self, fid: &str) -> Result<String, CommonError> {
        let exp = now_secs() + self.ttl_secs;
        let claims = FileIdClaims { fid: fid.to_string(), exp };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| CommonError::Internal(format!("jwt signing failed: {e}")))
    }

    /// Verifies `token`'s signature, expiry, and that its `fid` claim
    /// matches the file id the caller is actually about to act on.
    pub fn verify(&self, token: &str, expected_fid: &str) -> Result<(), CommonError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<FileIdClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| CommonError::Internal(format!("jwt verification failed: {e}")))?;
        if data.claims.fid != expected_fid {
            return Err(CommonError::Internal("jwt fid claim does not match request".into()));
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_for_matching_fid() {
        let signer = JwtSigner::new(b"test-secret", 60);
        let token = signer.issue("3,01637037d6deadbeef").unwrap();
        signer.verify(&token, "3,01637037d6deadbeef").unwrap();
    }

    #[test]
    fn verification_rejects_mismatched_fid() {
        let signer = JwtSigner::new(b"test-secret", 60);
        let token = signer.issue("3,01637037d6deadbeef").unwrap();
        assert!(signer.verify(&token, "4,01637037d6deadbeef").is_err());
    }

    #[test]
    fn verification_rejects_expired_token() {
        let signer = JwtSigner::new(b"test-secret", 0);
        let token = signer.issue("3,01637037d6deadbeef").unwrap();
        std::thread::sleep(std::time::Duration::from_secs(2));
        assert!(signer.verify(&token, "3,01637037d6deadbeef").is_err());
    }
}
