//! Signing key material and rotation.
//!
//! The key set is an immutable snapshot. Rotation and purge build a new
//! snapshot and publish it with a single atomic swap, so a reader holding a
//! snapshot sees either the whole set before the change or the whole set
//! after it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use p256::ecdsa::{
    Signature as EcSignature, SigningKey as EcSigningKey,
    VerifyingKey as EcVerifyingKey,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{Keypair, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const MIN_SECRET_LENGTH: usize = 32;
const MIN_RSA_BITS: usize = 2048;
const KID_FINGERPRINT_LENGTH: usize = 8;

type Result<T> = std::result::Result<T, KeyError>;
type HmacSha256 = Hmac<Sha256>;

/// Errors related to key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("no key with id `{0}`")]
    NotFound(String),
    #[error("no active signing key configured")]
    NoActiveKey,
    #[error("key id `{0}` is already in the key set")]
    DuplicateKeyId(String),
    #[error("the active signing key cannot be purged")]
    ActiveKeyPurge,
    #[error("secret must be at least {MIN_SECRET_LENGTH} bytes long")]
    WeakSecret,
    #[error("rsa modulus must be at least {MIN_RSA_BITS} bits")]
    WeakModulus,
    #[error("invalid base64 secret")]
    Base64,
    #[error("invalid private key pem: {0}")]
    Pem(String),
    #[error("{algorithm} needs {expected}")]
    MissingMaterial {
        algorithm: Algorithm,
        expected: &'static str,
    },
    #[error("signing failed")]
    Signing,
}

/// Signature algorithm of a key, as written in the token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// HMAC using SHA-256.
    HS256,
    /// RSASSA-PKCS1-v1_5 using SHA-256.
    RS256,
    /// ECDSA using P-256 and SHA-256.
    ES256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::HS256 => "HS256",
            Algorithm::RS256 => "RS256",
            Algorithm::ES256 => "ES256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Material {
    Hmac(Zeroizing<Vec<u8>>),
    Rsa {
        signing: Box<pkcs1v15::SigningKey<Sha256>>,
        verifying: Box<pkcs1v15::VerifyingKey<Sha256>>,
        public: Box<RsaPublicKey>,
    },
    Ecdsa(Box<EcSigningKey>),
}

/// A single key, identified by its key id.
pub struct Key {
    kid: String,
    material: Material,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl Key {
    /// Create an HMAC-SHA256 key from raw secret bytes.
    pub fn hmac(kid: Option<String>, secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(KeyError::WeakSecret);
        }

        Ok(Self {
            kid: kid.unwrap_or_else(|| fingerprint(secret)),
            material: Material::Hmac(Zeroizing::new(secret.to_vec())),
        })
    }

    /// Create an HMAC-SHA256 key from a standard base64 encoded secret.
    pub fn hmac_base64(kid: Option<String>, secret: &str) -> Result<Self> {
        let secret = Zeroizing::new(
            Base64::decode_vec(secret.trim()).map_err(|_| KeyError::Base64)?,
        );
        Self::hmac(kid, secret.as_slice())
    }

    /// Create an RS256 key from a PKCS#1 or PKCS#8 private key PEM.
    pub fn rsa_pem(kid: Option<String>, pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|err| KeyError::Pem(err.to_string()))
            .or_else(|_| {
                RsaPrivateKey::from_pkcs8_pem(pem)
                    .map_err(|err| KeyError::Pem(err.to_string()))
            })?;
        Self::rsa(kid, private)
    }

    /// Create an RS256 key from a parsed private key.
    pub fn rsa(kid: Option<String>, private: RsaPrivateKey) -> Result<Self> {
        if private.size() * 8 < MIN_RSA_BITS {
            return Err(KeyError::WeakModulus);
        }

        let public = private.to_public_key();
        let signing = pkcs1v15::SigningKey::<Sha256>::new(private);
        let verifying = signing.verifying_key();

        Ok(Self {
            kid: kid.unwrap_or_else(|| fingerprint(&public.n().to_bytes_be())),
            material: Material::Rsa {
                signing: Box::new(signing),
                verifying: Box::new(verifying),
                public: Box::new(public),
            },
        })
    }

    /// Create an ES256 key from a PKCS#8 or SEC1 P-256 private key PEM.
    pub fn ecdsa_pem(kid: Option<String>, pem: &str) -> Result<Self> {
        let signing = EcSigningKey::from_pkcs8_pem(pem)
            .map_err(|err| KeyError::Pem(err.to_string()))
            .or_else(|_| {
                p256::SecretKey::from_sec1_pem(pem)
                    .map(EcSigningKey::from)
                    .map_err(|err| KeyError::Pem(err.to_string()))
            })?;
        Ok(Self::ecdsa(kid, signing))
    }

    /// Create an ES256 key from a parsed signing key.
    pub fn ecdsa(kid: Option<String>, signing: EcSigningKey) -> Self {
        let point = signing.verifying_key().to_encoded_point(false);
        Self {
            kid: kid.unwrap_or_else(|| fingerprint(point.as_bytes())),
            material: Material::Ecdsa(Box::new(signing)),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        match self.material {
            Material::Hmac(_) => Algorithm::HS256,
            Material::Rsa { .. } => Algorithm::RS256,
            Material::Ecdsa(_) => Algorithm::ES256,
        }
    }

    /// Sign `message` with this key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.material {
            Material::Hmac(secret) => Ok(hmac_sha256(secret, message)?),
            Material::Rsa { signing, .. } => signing
                .try_sign(message)
                .map(|signature| signature.to_vec())
                .map_err(|_| KeyError::Signing),
            Material::Ecdsa(signing) => {
                let signature: EcSignature =
                    signing.try_sign(message).map_err(|_| KeyError::Signing)?;
                Ok(signature.to_bytes().to_vec())
            },
        }
    }

    /// Check `signature` over `message`.
    ///
    /// HMAC tags are compared in constant time.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match &self.material {
            Material::Hmac(secret) => match hmac_sha256(secret, message) {
                Ok(expected) => {
                    constant_time_eq::constant_time_eq(&expected, signature)
                },
                Err(_) => false,
            },
            Material::Rsa { verifying, .. } => {
                pkcs1v15::Signature::try_from(signature)
                    .map(|signature| verifying.verify(message, &signature).is_ok())
                    .unwrap_or(false)
            },
            Material::Ecdsa(signing) => EcSignature::from_slice(signature)
                .map(|signature| {
                    signing.verifying_key().verify(message, &signature).is_ok()
                })
                .unwrap_or(false),
        }
    }

    /// Public part of the key as a JWK (RFC 7517).
    ///
    /// Returns [`None`] for symmetric keys.
    pub fn public_jwk(&self) -> Option<PublicJwk> {
        match &self.material {
            Material::Hmac(_) => None,
            Material::Rsa { public, .. } => Some(PublicJwk::Rsa {
                kid: self.kid.clone(),
                alg: Algorithm::RS256,
                r#use: "sig",
                n: Base64UrlUnpadded::encode_string(&public.n().to_bytes_be()),
                e: Base64UrlUnpadded::encode_string(&public.e().to_bytes_be()),
            }),
            Material::Ecdsa(signing) => {
                let verifying: &EcVerifyingKey = signing.verifying_key();
                let point = verifying.to_encoded_point(false);
                let (x, y) = (point.x()?, point.y()?);

                Some(PublicJwk::Ec {
                    kid: self.kid.clone(),
                    alg: Algorithm::ES256,
                    r#use: "sig",
                    crv: "P-256",
                    x: Base64UrlUnpadded::encode_string(x),
                    y: Base64UrlUnpadded::encode_string(y),
                })
            },
        }
    }
}

fn hmac_sha256(secret: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| KeyError::WeakSecret)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn fingerprint(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    hex::encode(&digest[..KID_FINGERPRINT_LENGTH])
}

/// Public key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kty")]
pub enum PublicJwk {
    #[serde(rename = "RSA")]
    Rsa {
        kid: String,
        alg: Algorithm,
        r#use: &'static str,
        n: String,
        e: String,
    },
    #[serde(rename = "EC")]
    Ec {
        kid: String,
        alg: Algorithm,
        r#use: &'static str,
        crv: &'static str,
        x: String,
        y: String,
    },
}

/// A key kept for verification only after it stopped signing.
#[derive(Debug, Clone)]
pub struct RetiredKey {
    pub key: Arc<Key>,
    /// Unix timestamp (seconds) of the rotation that retired the key.
    pub retired_at: u64,
}

/// Immutable view of every known key.
#[derive(Debug, Clone)]
pub struct KeySet {
    active: Arc<Key>,
    retired: Vec<RetiredKey>,
}

impl KeySet {
    pub fn active(&self) -> &Arc<Key> {
        &self.active
    }

    pub fn retired(&self) -> &[RetiredKey] {
        &self.retired
    }

    /// Find any key, active or retired, by id.
    pub fn find(&self, kid: &str) -> Option<&Arc<Key>> {
        if self.active.kid == kid {
            return Some(&self.active);
        }

        self.retired
            .iter()
            .map(|retired| &retired.key)
            .find(|key| key.kid == kid)
    }

    /// Every key of the set, active first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Key>> {
        std::iter::once(&self.active)
            .chain(self.retired.iter().map(|retired| &retired.key))
    }
}

/// Owner of the process-wide key set.
pub struct KeyMaterialProvider {
    snapshot: ArcSwap<KeySet>,
    grace: Duration,
    writer: Mutex<()>,
}

impl fmt::Debug for KeyMaterialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterialProvider")
            .field("keys", &self.snapshot.load())
            .field("grace", &self.grace)
            .finish()
    }
}

impl KeyMaterialProvider {
    /// Create a new [`KeyMaterialProvider`] with a single active key.
    pub fn new(active: Key, grace: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(KeySet {
                active: Arc::new(active),
                retired: Vec::new(),
            }),
            grace,
            writer: Mutex::new(()),
        }
    }

    /// Create a provider from an ordered key list.
    ///
    /// The last key is the active one, earlier keys are loaded as retired at
    /// `now`. An empty list is refused: there is nothing to sign with.
    pub fn from_keys(keys: Vec<Key>, grace: Duration, now: u64) -> Result<Self> {
        let mut keys = keys;
        let active = keys.pop().ok_or(KeyError::NoActiveKey)?;
        let provider = Self::new(active, grace);

        let mut retired: Vec<RetiredKey> = Vec::with_capacity(keys.len());
        for key in keys {
            let kid = key.kid.clone();
            if provider.snapshot.load().active.kid == kid
                || retired.iter().any(|retired| retired.key.kid == kid)
            {
                return Err(KeyError::DuplicateKeyId(kid));
            }
            retired.push(RetiredKey {
                key: Arc::new(key),
                retired_at: now,
            });
        }

        let active = Arc::clone(&provider.snapshot.load().active);
        provider.snapshot.store(Arc::new(KeySet { active, retired }));
        Ok(provider)
    }

    /// Grace period a retired key stays usable for verification.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Current snapshot of the whole key set.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.snapshot.load_full()
    }

    /// Key used to sign new tokens.
    pub fn current_signing_key(&self) -> Arc<Key> {
        Arc::clone(&self.snapshot.load().active)
    }

    /// Key matching `kid`, active or retired.
    pub fn verification_key(&self, kid: &str) -> Result<Arc<Key>> {
        self.snapshot
            .load()
            .find(kid)
            .cloned()
            .ok_or_else(|| KeyError::NotFound(kid.to_owned()))
    }

    /// Key matching `kid` that may still verify a token at `now`.
    ///
    /// A retired key past its grace period is gone, purged or not.
    pub fn verification_key_at(&self, kid: &str, now: u64) -> Result<Arc<Key>> {
        let snapshot = self.snapshot.load();
        if snapshot.active.kid == kid {
            return Ok(Arc::clone(&snapshot.active));
        }

        let grace = self.grace.as_secs();
        snapshot
            .retired
            .iter()
            .find(|retired| {
                retired.key.kid == kid
                    && now < retired.retired_at.saturating_add(grace)
            })
            .map(|retired| Arc::clone(&retired.key))
            .ok_or_else(|| KeyError::NotFound(kid.to_owned()))
    }

    /// Make `key` the active signing key.
    ///
    /// The previous active key stays in the set for verification until it is
    /// purged.
    pub fn rotate(&self, key: Key, now: u64) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();

        if current.find(&key.kid).is_some() {
            return Err(KeyError::DuplicateKeyId(key.kid));
        }

        let mut retired = current.retired.clone();
        retired.push(RetiredKey {
            key: Arc::clone(&current.active),
            retired_at: now,
        });

        tracing::info!(
            new_kid = %key.kid,
            retired_kid = %current.active.kid,
            "signing key rotated"
        );

        self.snapshot.store(Arc::new(KeySet {
            active: Arc::new(key),
            retired,
        }));
        Ok(())
    }

    /// Drop retired keys whose grace period is over.
    ///
    /// Returns ids of the purged keys.
    pub fn purge_expired(&self, now: u64) -> Vec<String> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();
        let grace = self.grace.as_secs();

        let (expired, kept): (Vec<_>, Vec<_>) = current
            .retired
            .iter()
            .cloned()
            .partition(|retired| retired.retired_at.saturating_add(grace) <= now);

        if expired.is_empty() {
            return Vec::new();
        }

        self.snapshot.store(Arc::new(KeySet {
            active: Arc::clone(&current.active),
            retired: kept,
        }));

        let purged: Vec<String> =
            expired.into_iter().map(|retired| retired.key.kid.clone()).collect();
        tracing::info!(kids = ?purged, "retired signing keys purged");
        purged
    }

    /// Remove a retired key immediately.
    pub fn purge(&self, kid: &str) -> Result<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();

        if current.active.kid == kid {
            return Err(KeyError::ActiveKeyPurge);
        }

        let retired: Vec<RetiredKey> = current
            .retired
            .iter()
            .filter(|retired| retired.key.kid != kid)
            .cloned()
            .collect();
        if retired.len() == current.retired.len() {
            return Err(KeyError::NotFound(kid.to_owned()));
        }

        self.snapshot.store(Arc::new(KeySet {
            active: Arc::clone(&current.active),
            retired,
        }));
        tracing::info!(%kid, "signing key purged");
        Ok(())
    }
}
