// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of `Release` files.

APT clients accept two signature forms:

* A detached, armored signature in `Release.gpg` next to `Release`.
* An `InRelease` file holding the `Release` content inside the PGP cleartext
  signature framework.

[ReleaseSigner] abstracts over the mechanism producing these. [PgpReleaseSigner]
is an implementation backed by an in-process PGP secret key.
*/

use {
    crate::error::{RepoSyncError, Result},
    chrono::SubsecRound,
    pgp::{
        crypto::{HashAlgorithm, SymmetricKeyAlgorithm},
        packet::{Packet, SignatureConfig, SignatureType, Subpacket},
        types::{CompressionAlgorithm, KeyTrait, KeyVersion, SecretKeyTrait},
        Deserializable, KeyType, SecretKeyParams, SecretKeyParamsBuilder, SignedPublicKey,
        SignedSecretKey,
    },
    pgp_cleartext::cleartext_sign,
    serde::{Deserialize, Serialize},
    smallvec::{smallvec, SmallVec},
    std::io::Cursor,
};

/// Which signed forms of a `Release` file to produce.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SigningMode {
    /// `Release.gpg` only.
    Detached,
    /// `InRelease` only.
    Inline,
    /// Both `Release.gpg` and `InRelease`.
    Both,
}

impl Default for SigningMode {
    fn default() -> Self {
        Self::Both
    }
}

impl SigningMode {
    pub fn detached(&self) -> bool {
        matches!(self, Self::Detached | Self::Both)
    }

    pub fn inline(&self) -> bool {
        matches!(self, Self::Inline | Self::Both)
    }
}

/// Produces signatures over `Release` content.
pub trait ReleaseSigner: Send + Sync {
    /// Produce the content of a `Release.gpg` file for the given `Release` content.
    fn sign_detached(&self, release: &[u8]) -> Result<Vec<u8>>;

    /// Produce the content of an `InRelease` file for the given `Release` content.
    fn sign_inline(&self, release: &[u8]) -> Result<Vec<u8>>;
}

/// A [ReleaseSigner] using a PGP secret key.
pub struct PgpReleaseSigner {
    key: SignedSecretKey,
    passphrase: String,
    hash_algorithm: HashAlgorithm,
}

impl std::fmt::Debug for PgpReleaseSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgpReleaseSigner")
            .field("fingerprint", &hex::encode_upper(self.key.fingerprint()))
            .field("hash_algorithm", &self.hash_algorithm)
            .finish()
    }
}

impl PgpReleaseSigner {
    /// Construct an instance from a secret key and the passphrase unlocking it.
    pub fn new(key: SignedSecretKey, passphrase: impl ToString) -> Self {
        Self {
            key,
            passphrase: passphrase.to_string(),
            hash_algorithm: HashAlgorithm::SHA2_256,
        }
    }

    /// Construct an instance from an ASCII armored secret key.
    pub fn from_armored(data: &str, passphrase: impl ToString) -> Result<Self> {
        let (key, _) = SignedSecretKey::from_armor_single(Cursor::new(data.as_bytes()))?;

        Ok(Self::new(key, passphrase))
    }

    /// The secret key signatures are made with.
    pub fn key(&self) -> &SignedSecretKey {
        &self.key
    }

    /// Produce an armored binary signature over data.
    fn armored_signature(&self, data: &[u8]) -> Result<String> {
        let hashed_subpackets = vec![
            Subpacket::IssuerFingerprint(
                KeyVersion::V4,
                SmallVec::from_slice(&self.key.fingerprint()),
            ),
            Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
        ];
        let unhashed_subpackets = vec![Subpacket::Issuer(self.key.key_id())];

        let config = SignatureConfig::new_v4(
            Default::default(),
            SignatureType::Binary,
            self.key.algorithm(),
            self.hash_algorithm,
            hashed_subpackets,
            unhashed_subpackets,
        );

        let passphrase = self.passphrase.clone();
        let signature = config.sign(&self.key, || passphrase, Cursor::new(data))?;

        let packet = Packet::Signature(signature);
        let mut writer = Cursor::new(Vec::<u8>::new());
        pgp::armor::write(&packet, pgp::armor::BlockType::Signature, &mut writer, None)?;

        String::from_utf8(writer.into_inner())
            .map_err(|_| RepoSyncError::Signing("armored signature is not UTF-8".into()))
    }
}

impl ReleaseSigner for PgpReleaseSigner {
    fn sign_detached(&self, release: &[u8]) -> Result<Vec<u8>> {
        Ok(self.armored_signature(release)?.into_bytes())
    }

    fn sign_inline(&self, release: &[u8]) -> Result<Vec<u8>> {
        let passphrase = self.passphrase.clone();

        Ok(cleartext_sign(
            &self.key,
            || passphrase,
            self.hash_algorithm,
            Cursor::new(release),
        )?
        .into_bytes())
    }
}

/// Obtain a [SecretKeyParamsBuilder] suitable for a repository signing key.
pub fn signing_secret_key_params_builder(primary_user_id: impl ToString) -> SecretKeyParamsBuilder {
    let mut key_params = SecretKeyParamsBuilder::default();
    key_params
        .key_type(KeyType::Rsa(2048))
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![
            HashAlgorithm::SHA2_256,
            HashAlgorithm::SHA2_384,
            HashAlgorithm::SHA2_512
        ])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .can_create_certificates(false)
        .can_sign(true)
        .primary_user_id(primary_user_id.to_string());

    key_params
}

/// Generate a self-signed key pair.
pub fn create_self_signed_key<PW>(
    params: SecretKeyParams,
    key_passphrase: PW,
) -> pgp::errors::Result<(SignedSecretKey, SignedPublicKey)>
where
    PW: (FnOnce() -> String) + Clone,
{
    let secret_key = params.generate()?;
    let secret_key_signed = secret_key.sign(key_passphrase.clone())?;

    let public_key = secret_key_signed.public_key();
    let public_key_signed = public_key.sign(&secret_key_signed, key_passphrase)?;

    Ok((secret_key_signed, public_key_signed))
}
