//! Ed25519 signing and verification of 32-byte digests.
//!
//! Handshakes carry a signature over their token. Ed25519 has no public key
//! recovery, so the receiver verifies against the key the peer declared.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use ledgernet_types::{Digest, PrivateKey, PublicKey, Signature};

/// Sign a digest with a private key.
pub fn sign_digest(digest: &Digest, private_key: &PrivateKey) -> Signature {
    let signing_key = SigningKey::from_bytes(&private_key.0);
    Signature(signing_key.sign(digest.as_bytes()).to_bytes())
}

/// Verify a signature over `digest` against a declared public key.
///
/// Returns `false` for malformed keys as well as bad signatures.
pub fn verify_digest(digest: &Digest, signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let dalek_sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify(digest.as_bytes(), &dalek_sig).is_ok()
}
