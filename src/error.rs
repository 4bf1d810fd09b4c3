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
use crate::timestamp::transport::TransportError;
use goblin::error::Error as PeError;
use openssl::error::ErrorStack;
use snafu::prelude::*;
use std::io::Error as IoError;
use tempfile::PersistError;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure category, stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    MalformedImage,
    UnsupportedDigestAlgorithm,
    UnsupportedSignatureAlgorithm,
    SigningIdentity,
    TimestampProtocol,
    CertificateTable,
    Verification,
    Io,
}

#[derive(Debug, Snafu)]
pub struct Error(InnerError);

impl Error {
    /// Build a credential failure, for use by external [`crate::KeyStore`] implementations.
    pub fn signing_identity<S: Into<String>>(reason: S) -> Self {
        Error(InnerError::SigningIdentity {
            reason: reason.into(),
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.0 {
            InnerError::ReadFile { .. }
            | InnerError::WriteFile { .. }
            | InnerError::PersistFile { .. } => ErrorKind::Io,
            InnerError::ParseImage { .. }
            | InnerError::PE { .. }
            | InnerError::MissingOptHdr {}
            | InnerError::InvalidMagicInOptHdr { .. }
            | InnerError::ReadByte { .. }
            | InnerError::DecodeSignature { .. }
            | InnerError::InvalidSignature { .. }
            | InnerError::WinCert { .. } => ErrorKind::MalformedImage,
            InnerError::UnsupportedDigest { .. } | InnerError::UnknownDigestOid { .. } => {
                ErrorKind::UnsupportedDigestAlgorithm
            }
            InnerError::UnsupportedSignature { .. } => ErrorKind::UnsupportedSignatureAlgorithm,
            InnerError::SigningIdentity { .. }
            | InnerError::KeyStore { .. }
            | InnerError::AliasNotFound { .. }
            | InnerError::EmptyChain { .. }
            | InnerError::ParseCertificate { .. } => ErrorKind::SigningIdentity,
            InnerError::HttpClient { .. }
            | InnerError::TimestampTransport { .. }
            | InnerError::TimestampHttpStatus { .. }
            | InnerError::TimestampMalformed { .. }
            | InnerError::TimestampDecode { .. }
            | InnerError::TimestampBase64 { .. }
            | InnerError::TimestampRejected { .. }
            | InnerError::TimestampNonceMismatch { .. }
            | InnerError::TimestampImprintMismatch {}
            | InnerError::TimestampDigestMismatch { .. }
            | InnerError::TimestampRetriesExhausted { .. } => ErrorKind::TimestampProtocol,
            InnerError::WriteByte { .. }
            | InnerError::CertificateTable { .. }
            | InnerError::Encode { .. } => ErrorKind::CertificateTable,
            InnerError::Verify { .. }
            | InnerError::VerifyCrypto { .. }
            | InnerError::NoSignature {} => ErrorKind::Verification,
        }
    }

    /// True when the failure is a network hiccup that another attempt may cure.
    pub fn is_transient(&self) -> bool {
        match &self.0 {
            InnerError::TimestampTransport { source, .. } => source.is_transient(),
            InnerError::TimestampHttpStatus { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self.0, InnerError::TimestampRetriesExhausted { .. })
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub(crate) enum InnerError {
    #[snafu(display("Failed to read file {path}"))]
    ReadFile { source: IoError, path: String },
    #[snafu(display("Failed to write file {path}"))]
    WriteFile { source: IoError, path: String },
    #[snafu(display("Failed to replace file {path}"))]
    PersistFile { source: PersistError, path: String },
    #[snafu(display("Missing optional header"))]
    MissingOptHdr {},
    #[snafu(display("Invalid magic:{magic:#06x} in optional header"))]
    InvalidMagicInOptHdr { magic: u16 },
    #[snafu(display("Failed to read {size} byte from {offset:#x}"))]
    ReadByte {
        offset: usize,
        size: usize,
        source: IoError,
    },
    #[snafu(display("Failed to write {size} byte at {offset:#x}"))]
    WriteByte {
        offset: usize,
        size: usize,
        source: IoError,
    },
    #[snafu(display("Parse PE image failed, reason: {reason}"))]
    ParseImage { reason: String },
    #[snafu(display("Failed to decode to a PE/COFF struct"))]
    PE { source: PeError },
    #[snafu(display("Failed to decode an embedded signature"))]
    DecodeSignature { source: der::Error },
    #[snafu(display("Invalid embedded signature, reason: {reason}"))]
    InvalidSignature { reason: String },
    #[snafu(display("Invalid certificate table entry, reason: {reason}"))]
    WinCert { reason: String },
    #[snafu(display("Not supported digest algorithm: {name}"))]
    UnsupportedDigest { name: String },
    #[snafu(display("Not supported digest algorithm oid: {oid}"))]
    UnknownDigestOid { oid: String },
    #[snafu(display("Not supported signature algorithm: {key} with {digest}"))]
    UnsupportedSignature { key: String, digest: String },
    #[snafu(display("Signing identity error, reason: {reason}"))]
    SigningIdentity { reason: String },
    #[snafu(display("Key store operation failed for alias {alias}"))]
    KeyStore { alias: String, source: ErrorStack },
    #[snafu(display("Alias {alias} not found in key store"))]
    AliasNotFound { alias: String },
    #[snafu(display("Empty certificate chain for alias {alias}"))]
    EmptyChain { alias: String },
    #[snafu(display("Parse certificate failed for alias {alias}"))]
    ParseCertificate { alias: String, source: der::Error },
    #[snafu(display("Failed to build the HTTP client"))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("Timestamp request to {url} failed on attempt {attempt}"))]
    TimestampTransport {
        url: String,
        attempt: u32,
        source: TransportError,
    },
    #[snafu(display("Timestamp authority {url} responded with status {status}"))]
    TimestampHttpStatus { url: String, status: u16 },
    #[snafu(display("Malformed timestamp response, reason: {reason}"))]
    TimestampMalformed { reason: String },
    #[snafu(display("Failed to decode the timestamp response"))]
    TimestampDecode { source: der::Error },
    #[snafu(display("Failed to decode the base64 timestamp response"))]
    TimestampBase64 { source: base64::DecodeError },
    #[snafu(display("Timestamp request rejected with status {status}: {reason}"))]
    TimestampRejected { status: u32, reason: String },
    #[snafu(display("Timestamp nonce mismatch, expected {expected} but got {actual}"))]
    TimestampNonceMismatch { expected: u64, actual: String },
    #[snafu(display("Timestamp message imprint does not match the signature"))]
    TimestampImprintMismatch {},
    #[snafu(display("Timestamp counter-signature mismatch: {reason}"))]
    TimestampDigestMismatch { reason: String },
    #[snafu(display("Timestamping gave up after {attempts} attempts, last error: {last}"))]
    TimestampRetriesExhausted { attempts: u32, last: String },
    #[snafu(display("Certificate table error, reason: {reason}"))]
    CertificateTable { reason: String },
    #[snafu(display("Failed to encode {what}"))]
    Encode { what: String, source: der::Error },
    #[snafu(display("Verification failed, reason: {reason}"))]
    Verify { reason: String },
    #[snafu(display("Cryptographic verification failed"))]
    VerifyCrypto { source: ErrorStack },
    #[snafu(display("No signature existed"))]
    NoSignature {},
}
