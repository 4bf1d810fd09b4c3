/*
 *
 *  * // Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
 *  * //
 *  * // signatrust is licensed under Mulan PSL v2.
 *  * // You can use this software according to the terms and conditions of the Mulan
 *  * // PSL v2.
 *  * // You may obtain a copy of Mulan PSL v2 at:
 *  * //         http://license.coscl.org.cn/MulanPSL2
 *  * // THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
 *  * // KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
 *  * // NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 *  * // See the Mulan PSL v2 for more details.
 *
 */
//! Signing identities.
//!
//! The engine never loads credentials itself. It borrows a [`KeyStore`], which
//! may be backed by files, a PKCS#11 token or a remote signing service, and
//! resolves one alias into a [`SigningIdentity`].
use crate::asn1::{
    ECDSA_WITH_SHA1, ECDSA_WITH_SHA256, ECDSA_WITH_SHA384, ECDSA_WITH_SHA512, RSA_ENCRYPTION,
};
use crate::digest::DigestAlgorithm;
use crate::error::{
    AliasNotFoundSnafu, EmptyChainSnafu, EncodeSnafu, Error, KeyStoreSnafu,
    ParseCertificateSnafu, Result, UnsupportedSignatureSnafu,
};
use der::asn1::{Any, Null};
use der::Decode;
use log::debug;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::fmt;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

/// Public key family of a signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("RSA"),
            KeyAlgorithm::Ecdsa => f.write_str("ECDSA"),
        }
    }
}

impl KeyAlgorithm {
    /// The `digestEncryptionAlgorithm` of a signer info made with this key and `digest`.
    ///
    /// RSA signers use plain `rsaEncryption`, as Authenticode verifiers expect.
    pub fn signature_algorithm(&self, digest: DigestAlgorithm) -> Result<AlgorithmIdentifierOwned> {
        match (self, digest) {
            (KeyAlgorithm::Rsa, _) => Ok(AlgorithmIdentifierOwned {
                oid: RSA_ENCRYPTION,
                parameters: Some(Any::encode_from(&Null).context(EncodeSnafu {
                    what: "signature algorithm parameters",
                })?),
            }),
            (KeyAlgorithm::Ecdsa, DigestAlgorithm::Md5) => UnsupportedSignatureSnafu {
                key: self.to_string(),
                digest: digest.to_string(),
            }
            .fail()?,
            (KeyAlgorithm::Ecdsa, _) => {
                let oid = match digest {
                    DigestAlgorithm::Sha1 => ECDSA_WITH_SHA1,
                    DigestAlgorithm::Sha384 => ECDSA_WITH_SHA384,
                    DigestAlgorithm::Sha512 => ECDSA_WITH_SHA512,
                    _ => ECDSA_WITH_SHA256,
                };
                Ok(AlgorithmIdentifierOwned {
                    oid,
                    parameters: None,
                })
            }
        }
    }
}

/// Credential store capability.
pub trait KeyStore {
    fn aliases(&self) -> Result<Vec<String>>;

    /// Certificate chain of `alias`, leaf first.
    fn certificate_chain(&self, alias: &str) -> Result<Vec<Certificate>>;

    fn key_algorithm(&self, alias: &str) -> Result<KeyAlgorithm>;

    /// Sign `data` with the private key of `alias`, hashing it with `digest`.
    fn sign(&self, alias: &str, digest: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>>;
}

/// One alias of a [`KeyStore`], resolved for a signing operation.
pub struct SigningIdentity<'a> {
    store: &'a dyn KeyStore,
    alias: String,
    chain: Vec<Certificate>,
    key_algorithm: KeyAlgorithm,
}

impl<'a> fmt::Debug for SigningIdentity<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("alias", &self.alias)
            .field("chain", &self.chain.len())
            .field("key_algorithm", &self.key_algorithm)
            .finish()
    }
}

impl<'a> SigningIdentity<'a> {
    pub fn from_store(store: &'a dyn KeyStore, alias: &str) -> Result<Self> {
        let chain = store.certificate_chain(alias)?;
        if chain.is_empty() {
            EmptyChainSnafu { alias }.fail()?
        }
        let key_algorithm = store.key_algorithm(alias)?;
        debug!(
            "signing identity {}: {} key, {} certificate(s)",
            alias,
            key_algorithm,
            chain.len()
        );
        Ok(SigningIdentity {
            store,
            alias: alias.to_string(),
            chain,
            key_algorithm,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn leaf(&self) -> &Certificate {
        // from_store refuses an empty chain
        &self.chain[0]
    }

    pub fn certificate_chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    pub fn sign(&self, digest: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        self.store.sign(&self.alias, digest, data)
    }
}

struct Entry {
    key: PKey<Private>,
    chain: Vec<X509>,
}

/// In-memory [`KeyStore`] over openssl keys and certificates.
#[derive(Default)]
pub struct OpensslKeyStore {
    entries: HashMap<String, Entry>,
}

impl OpensslKeyStore {
    pub fn new() -> Self {
        OpensslKeyStore::default()
    }

    pub fn insert(&mut self, alias: &str, key: PKey<Private>, chain: Vec<X509>) -> Result<()> {
        if chain.is_empty() {
            EmptyChainSnafu { alias }.fail()?
        }
        self.entries
            .insert(alias.to_string(), Entry { key, chain });
        Ok(())
    }

    /// Load a PEM private key and a PEM certificate chain (leaf first).
    pub fn from_pem(alias: &str, key_pem: &[u8], chain_pem: &[u8]) -> Result<Self> {
        let key = PKey::private_key_from_pem(key_pem).context(KeyStoreSnafu { alias })?;
        let chain = X509::stack_from_pem(chain_pem).context(KeyStoreSnafu { alias })?;
        let mut store = OpensslKeyStore::new();
        store.insert(alias, key, chain)?;
        Ok(store)
    }

    fn entry(&self, alias: &str) -> Result<&Entry> {
        self.entries
            .get(alias)
            .context(AliasNotFoundSnafu { alias })
            .map_err(Into::into)
    }
}

impl KeyStore for OpensslKeyStore {
    fn aliases(&self) -> Result<Vec<String>> {
        let mut aliases: Vec<String> = self.entries.keys().cloned().collect();
        aliases.sort();
        Ok(aliases)
    }

    fn certificate_chain(&self, alias: &str) -> Result<Vec<Certificate>> {
        let entry = self.entry(alias)?;
        let mut chain = Vec::with_capacity(entry.chain.len());
        for cert in entry.chain.iter() {
            let der = cert.to_der().context(KeyStoreSnafu { alias })?;
            chain.push(Certificate::from_der(&der).context(ParseCertificateSnafu { alias })?);
        }
        Ok(chain)
    }

    fn key_algorithm(&self, alias: &str) -> Result<KeyAlgorithm> {
        let entry = self.entry(alias)?;
        match entry.key.id() {
            Id::RSA => Ok(KeyAlgorithm::Rsa),
            Id::EC => Ok(KeyAlgorithm::Ecdsa),
            other => Err(Error::signing_identity(format!(
                "alias {} holds an unsupported key type {:?}",
                alias, other
            ))),
        }
    }

    fn sign(&self, alias: &str, digest: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        let entry = self.entry(alias)?;
        let mut signer =
            Signer::new(digest.message_digest(), &entry.key).context(KeyStoreSnafu { alias })?;
        signer.update(data).context(KeyStoreSnafu { alias })?;
        signer.sign_to_vec().context(KeyStoreSnafu { alias }).map_err(Into::into)
    }
}
