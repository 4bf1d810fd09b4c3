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
use crate::asn1::{ID_MD5, ID_SHA1, ID_SHA256, ID_SHA384, ID_SHA512};
use crate::channel::{padding_for, ByteChannel};
use crate::error::{EncodeSnafu, Error, Result, UnknownDigestOidSnafu, UnsupportedDigestSnafu};
use crate::pe::{PeFile, CERT_TABLE_ALIGNMENT};
use der::asn1::{Any, Null, ObjectIdentifier};
use digest::DynDigest;
use log::debug;
use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::str::FromStr;
use x509_cert::spki::AlgorithmIdentifierOwned;

const SIZEOF_CHECKSUM: usize = 4;
const SIZEOF_CERT_DIRECTORY: usize = 8;

const ALL: [DigestAlgorithm; 5] = [
    DigestAlgorithm::Md5,
    DigestAlgorithm::Sha1,
    DigestAlgorithm::Sha256,
    DigestAlgorithm::Sha384,
    DigestAlgorithm::Sha512,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Md5 => ID_MD5,
            DigestAlgorithm::Sha1 => ID_SHA1,
            DigestAlgorithm::Sha256 => ID_SHA256,
            DigestAlgorithm::Sha384 => ID_SHA384,
            DigestAlgorithm::Sha512 => ID_SHA512,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        ALL.iter()
            .find(|alg| alg.oid() == *oid)
            .copied()
            .context(UnknownDigestOidSnafu {
                oid: oid.to_string(),
            })
            .map_err(Into::into)
    }

    /// Digest size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Md5 => Box::new(md5::Md5::default()),
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            DigestAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            DigestAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// One-shot hash of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            DigestAlgorithm::Md5 => MessageDigest::md5(),
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    /// The identifier with explicit NULL parameters, as Windows writes it.
    pub fn algorithm_identifier(&self) -> Result<AlgorithmIdentifierOwned> {
        Ok(AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: Some(Any::encode_from(&Null).context(EncodeSnafu {
                what: "digest algorithm parameters",
            })?),
        })
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => UnsupportedDigestSnafu { name: s }.fail()?,
        }
    }
}

/// The Authenticode hash of an image under one algorithm.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthenticodeDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl AuthenticodeDigest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// the image is hashed in file order, excluding:
//   the checksum field,
//   the certificate table directory entry,
//   the certificate table itself.
// data behind the certificate table is hashed. The table is hashed as if it
// started on an 8-byte boundary, with zero padding in front of it; an image
// without a table is hashed as if zero-padded to 8 bytes, which is where the
// table will go.
pub(crate) fn compute_digest(pe: &PeFile, alg: DigestAlgorithm) -> Result<AuthenticodeDigest> {
    let channel = pe.channel();
    let mut hasher = alg.hasher();

    let checksum_offset = pe.checksum_field_offset();
    hash_range(hasher.as_mut(), channel, 0, checksum_offset)?;
    let mut begin = checksum_offset + SIZEOF_CHECKSUM;

    match pe.certificate_directory_offset() {
        Some(dir_offset) => {
            hash_range(hasher.as_mut(), channel, begin, dir_offset)?;
            begin = dir_offset + SIZEOF_CERT_DIRECTORY;
        }
        None => {
            debug!("no certificate table directory entry, treated as empty at the end of data directories");
            hash_range(hasher.as_mut(), channel, begin, pe.data_directories_end())?;
            begin = pe.data_directories_end();
        }
    }

    let len = channel.len();
    match pe.certificate_table_region() {
        Some(region) => {
            hash_range(hasher.as_mut(), channel, begin, region.offset)?;
            hash_padding(hasher.as_mut(), region.offset);
            debug!(
                "skip certificate table [{:#04x} - {:#04x}]",
                region.offset,
                region.end()
            );
            hash_range(hasher.as_mut(), channel, region.end(), len)?;
        }
        None => {
            hash_range(hasher.as_mut(), channel, begin, len)?;
            hash_padding(hasher.as_mut(), len);
        }
    }

    Ok(AuthenticodeDigest {
        algorithm: alg,
        bytes: hasher.finalize().to_vec(),
    })
}

fn hash_range(
    hasher: &mut dyn DynDigest,
    channel: &ByteChannel,
    begin: usize,
    end: usize,
) -> Result<()> {
    if end > begin {
        debug!("hashed from [{:#04x} - {:#04x}]", begin, end);
        hasher.update(channel.slice(begin..end)?);
    }
    Ok(())
}

/// Zeros bringing `offset` to the certificate table alignment.
fn hash_padding(hasher: &mut dyn DynDigest, offset: usize) {
    let padding = padding_for(offset, CERT_TABLE_ALIGNMENT);
    if padding > 0 {
        debug!("hashed {} bytes of zero padding", padding);
        hasher.update(&vec![0u8; padding]);
    }
}
