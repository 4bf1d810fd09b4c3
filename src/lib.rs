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
//! Authenticode signing and timestamping of PE images.
//!
//! ```no_run
//! use pe_signer::{OpensslKeyStore, PeFile, PeSigner, SignOptions, SigningIdentity};
//!
//! # fn main() -> pe_signer::Result<()> {
//! let store = OpensslKeyStore::from_pem("release", b"...", b"...")?;
//! let identity = SigningIdentity::from_store(&store, "release")?;
//! let signer = PeSigner::new(identity, SignOptions::default())?;
//! let mut pe = PeFile::open("app.exe")?;
//! signer.sign(&mut pe)?;
//! pe.save()?;
//! # Ok(())
//! # }
//! ```
pub mod asn1;
pub mod channel;
pub mod config;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod pe;
pub mod signer;
pub mod timestamp;
pub mod wincert;

pub use config::{SignOptions, SignaturePolicy, TimestampConfig};
pub use crate::digest::{AuthenticodeDigest, DigestAlgorithm};
pub use envelope::{SignatureBuilder, SignatureEnvelope};
pub use error::{Error, ErrorKind, Result};
pub use identity::{KeyAlgorithm, KeyStore, OpensslKeyStore, SigningIdentity};
pub use pe::{PeFile, Region, Section};
pub use signer::{read_signatures, remove_signatures, timestamp_signatures, PeSigner};
pub use timestamp::transport::{HttpResponse, HttpTransport, TimestampTransport, TransportError};
pub use timestamp::{TimestampProtocol, TimestampToken, Timestamper};
pub use wincert::{CertificateType, WinCertificate};
