//! # Authorization
//!
//! Every item on the network carries proof of who published it and of
//! the work spent publishing it:
//!
//! - an Ed25519 signature by the owner over the item's signing digest;
//! - a hashcash proof of work over the item's [`DataId`].
//!
//! Peers verify both before storing or relaying. Removal requests are
//! signed over a separate digest and checked against the owner key kept
//! with the stored item, so only the publisher can take an item down.
//!
//! The primitives are pluggable through [`AuthorizationService`]. The
//! data plane only calls that trait. [`DefaultAuthorizationService`] is
//! the Ed25519 + hashcash implementation used by the node binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::item::{DataId, DistributedDataItem};
use super::pow::{self, PowError, ProofOfWork};
use crate::crypto::{KeyPair, PublicKey, Signature};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("signature does not verify against the owner key")]
    BadSignature,

    #[error("proof of work below required difficulty {required}")]
    InsufficientWork { required: u8 },

    #[error("requester is not the owner of the item")]
    NotOwner,

    #[error("proof of work: {0}")]
    Pow(#[from] PowError),

    #[error("authorization task failed: {0}")]
    Task(String),
}

/// Owner identity and proofs attached to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub owner: PublicKey,
    pub signature: Signature,
    pub proof_of_work: ProofOfWork,
}

/// An item together with its authorization. This is what travels and
/// what storage keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedData {
    pub item: DistributedDataItem,
    pub authorization: Authorization,
}

impl AuthenticatedData {
    pub fn id(&self) -> DataId {
        self.item.id()
    }

    pub fn owner(&self) -> &PublicKey {
        &self.authorization.owner
    }
}

/// Digest the owner signs to remove an item.
pub fn removal_digest(data_id: &DataId, class_name: &str, sequence_number: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tessera/remove/v1");
    hasher.update(data_id.as_bytes());
    hasher.update(class_name.as_bytes());
    hasher.update(&sequence_number.to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// Sign/verify and prove/check capability consumed by the data plane.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Signs `item` and mints its proof of work.
    async fn authorize(
        &self,
        item: &DistributedDataItem,
        keypair: &KeyPair,
    ) -> Result<Authorization, AuthError>;

    /// Checks signature and proof of work of received data.
    fn verify(&self, data: &AuthenticatedData) -> Result<(), AuthError>;

    fn sign(&self, message: &[u8], keypair: &KeyPair) -> Signature;

    fn verify_signature(
        &self,
        owner: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), AuthError>;
}

/// Ed25519 signatures plus SHA-256 hashcash.
#[derive(Debug, Clone)]
pub struct DefaultAuthorizationService {
    pow_difficulty: u8,
}

impl DefaultAuthorizationService {
    pub fn new(pow_difficulty: u8) -> Self {
        Self { pow_difficulty }
    }

    pub fn pow_difficulty(&self) -> u8 {
        self.pow_difficulty
    }
}

#[async_trait]
impl AuthorizationService for DefaultAuthorizationService {
    async fn authorize(
        &self,
        item: &DistributedDataItem,
        keypair: &KeyPair,
    ) -> Result<Authorization, AuthError> {
        let signature = keypair.sign(&item.signing_digest());
        let data_id = item.id();
        let difficulty = self.pow_difficulty;
        let proof_of_work = tokio::task::spawn_blocking(move || pow::mint(&data_id, difficulty))
            .await
            .map_err(|e| AuthError::Task(e.to_string()))??;

        Ok(Authorization {
            owner: keypair.public_key(),
            signature,
            proof_of_work,
        })
    }

    fn verify(&self, data: &AuthenticatedData) -> Result<(), AuthError> {
        let auth = &data.authorization;
        self.verify_signature(&auth.owner, &data.item.signing_digest(), &auth.signature)?;
        if !pow::verify(&data.id(), &auth.proof_of_work, self.pow_difficulty) {
            return Err(AuthError::InsufficientWork {
                required: self.pow_difficulty,
            });
        }
        Ok(())
    }

    fn sign(&self, message: &[u8], keypair: &KeyPair) -> Signature {
        keypair.sign(message)
    }

    fn verify_signature(
        &self,
        owner: &PublicKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), AuthError> {
        if owner.verify(message, signature) {
            Ok(())
        } else {
            Err(AuthError::BadSignature)
        }
    }
}
