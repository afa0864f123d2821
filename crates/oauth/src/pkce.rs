use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    sha2::{Digest, Sha256},
};

use crate::types::PkceChallenge;

/// Generate a PKCE verifier (32 random bytes, base64url) and its S256 challenge.
#[must_use]
pub fn generate_pkce() -> PkceChallenge {
    let verifier = random_token(32);
    let challenge = s256_challenge(&verifier);
    PkceChallenge {
        verifier,
        challenge,
    }
}

/// Random `state` value correlating the redirect with the flow that started it.
#[must_use]
pub fn generate_state() -> String {
    random_token(24)
}

/// `BASE64URL(SHA256(verifier))` per RFC 7636 §4.2.
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
