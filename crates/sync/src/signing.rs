//! Receipt signing and verification
//!
//! Receipts are addressed by a CIDv1 (dag-cbor codec, sha2-256 multihash,
//! multibase base32) computed over the payload bytes, and signed with the
//! sender's Ed25519 key over those same bytes.

use std::collections::HashMap;

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::{Envelope, JarId, VerificationError, VerificationErrorKind, Verifier};

const CID_V1: u8 = 0x01;
const DAG_CBOR_CODEC: u8 = 0x71;
const SHA2_256_CODE: u8 = 0x12;
const SHA2_256_LEN: u8 = 0x20;

/// Content ID of a receipt payload, e.g. `bafyrei...`.
pub fn content_id_for(payload: &[u8]) -> String {
	let hash = Sha256::digest(payload);

	let mut cid = Vec::with_capacity(4 + hash.len());
	cid.extend_from_slice(&[CID_V1, DAG_CBOR_CODEC, SHA2_256_CODE, SHA2_256_LEN]);
	cid.extend_from_slice(&hash);

	format!("b{}", BASE32_NOPAD.encode(&cid).to_ascii_lowercase())
}

/// Verifies envelopes against a roster of member signing keys.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
	senders: HashMap<String, VerifyingKey>,
}

impl Ed25519Verifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_sender(&mut self, sender_id: impl Into<String>, key: VerifyingKey) {
		self.senders.insert(sender_id.into(), key);
	}

	#[must_use]
	pub fn with_sender(mut self, sender_id: impl Into<String>, key: VerifyingKey) -> Self {
		self.register_sender(sender_id, key);
		self
	}
}

impl Verifier for Ed25519Verifier {
	fn verify(&self, envelope: &Envelope) -> Result<(), VerificationError> {
		let computed = content_id_for(&envelope.payload);
		if computed != envelope.content_id {
			return Err(VerificationError::new(
				VerificationErrorKind::ContentMismatch,
				format!("claimed {}, computed {computed}", envelope.content_id),
			));
		}

		let key = self.senders.get(&envelope.sender_id).ok_or_else(|| {
			VerificationError::new(
				VerificationErrorKind::UnknownSender,
				format!("no key registered for {}", envelope.sender_id),
			)
		})?;

		let signature = Signature::from_slice(&envelope.signature).map_err(|e| {
			VerificationError::new(VerificationErrorKind::Malformed, e.to_string())
		})?;

		key.verify_strict(&envelope.payload, &signature)
			.map_err(|e| VerificationError::new(VerificationErrorKind::InvalidSignature, e.to_string()))
	}
}

/// Seals payloads into signed envelopes on behalf of one sender.
pub struct EnvelopeSigner {
	sender_id: String,
	key: SigningKey,
}

impl EnvelopeSigner {
	pub fn new(sender_id: impl Into<String>, key: SigningKey) -> Self {
		Self {
			sender_id: sender_id.into(),
			key,
		}
	}

	pub fn sender_id(&self) -> &str {
		&self.sender_id
	}

	pub fn verifying_key(&self) -> VerifyingKey {
		self.key.verifying_key()
	}

	/// Builds the envelope the relay would deliver for `payload` at `sequence`.
	pub fn seal(
		&self,
		jar_id: JarId,
		sequence: u64,
		payload: Vec<u8>,
		parent_content_id: Option<String>,
	) -> Envelope {
		let signature = self.key.sign(&payload);

		Envelope {
			jar_id,
			sequence,
			content_id: content_id_for(&payload),
			signature: signature.to_bytes().to_vec(),
			payload,
			sender_id: self.sender_id.clone(),
			parent_content_id,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn signer(seed: u8, sender_id: &str) -> EnvelopeSigner {
		EnvelopeSigner::new(sender_id, SigningKey::from_bytes(&[seed; 32]))
	}

	#[test]
	fn content_id_is_a_dag_cbor_cidv1() {
		let cid = content_id_for(b"receipt");

		// 36 bytes of CID encode to 58 base32 characters, plus the multibase prefix
		assert_eq!(cid.len(), 59);
		assert!(cid.starts_with("bafyrei"), "{cid}");
		assert_eq!(cid, content_id_for(b"receipt"));
		assert_ne!(cid, content_id_for(b"receipt!"));
	}

	#[test]
	fn accepts_sealed_envelopes_from_known_senders() {
		let alice = signer(7, "did:buds:alice");
		let verifier = Ed25519Verifier::new().with_sender(alice.sender_id(), alice.verifying_key());

		let envelope = alice.seal(JarId::new_v4(), 1, b"first".to_vec(), None);
		assert_eq!(verifier.verify(&envelope), Ok(()));
	}

	#[test]
	fn rejects_tampered_payloads_and_signatures() {
		let alice = signer(7, "did:buds:alice");
		let verifier = Ed25519Verifier::new().with_sender(alice.sender_id(), alice.verifying_key());
		let envelope = alice.seal(JarId::new_v4(), 1, b"first".to_vec(), None);

		let mut payload_swapped = envelope.clone();
		payload_swapped.payload = b"second".to_vec();
		assert_eq!(
			verifier.verify(&payload_swapped).map_err(|e| e.kind),
			Err(VerificationErrorKind::ContentMismatch)
		);

		let mut resealed = envelope.clone();
		resealed.payload = b"second".to_vec();
		resealed.content_id = content_id_for(&resealed.payload);
		assert_eq!(
			verifier.verify(&resealed).map_err(|e| e.kind),
			Err(VerificationErrorKind::InvalidSignature)
		);

		let mut truncated = envelope;
		truncated.signature.truncate(10);
		assert_eq!(
			verifier.verify(&truncated).map_err(|e| e.kind),
			Err(VerificationErrorKind::Malformed)
		);
	}

	#[test]
	fn rejects_unknown_senders() {
		let alice = signer(7, "did:buds:alice");
		let mallory = signer(9, "did:buds:mallory");
		let verifier = Ed25519Verifier::new().with_sender(alice.sender_id(), alice.verifying_key());

		let envelope = mallory.seal(JarId::new_v4(), 1, b"first".to_vec(), None);
		let err = verifier.verify(&envelope).unwrap_err();
		assert_eq!(err.kind, VerificationErrorKind::UnknownSender);
		assert!(err.is_integrity_failure());
	}
}
