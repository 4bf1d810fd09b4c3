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
//! Certificate table codec and patcher.
//!
//! The certificate table is a sequence of `WIN_CERTIFICATE` entries:
//!
//! ```text
//! typedef struct _WIN_CERTIFICATE {
//!     DWORD dwLength;
//!     WORD  wRevision;
//!     WORD  wCertificateType;
//!     BYTE  bCertificate[ANYSIZE_ARRAY];
//! } WIN_CERTIFICATE;
//! ```
//!
//! every entry starts on an 8-byte boundary.
use crate::channel::padding_for;
use crate::envelope::SignatureEnvelope;
use crate::error::{ReadByteSnafu, Result, WinCertSnafu, WriteByteSnafu};
use crate::pe::{PeFile, CERT_TABLE_ALIGNMENT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use snafu::ResultExt;
use std::io::Cursor;
use std::mem;

pub const WIN_CERT_REVISION_1_0: u16 = 0x0100;
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;
const SIZEOF_WIN_CERT_HEADER: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateType {
    X509,
    PkcsSignedData,
    Reserved1,
    TsStackSigned,
    Unknown(u16),
}

impl From<u16> for CertificateType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => CertificateType::X509,
            0x0002 => CertificateType::PkcsSignedData,
            0x0003 => CertificateType::Reserved1,
            0x0004 => CertificateType::TsStackSigned,
            other => CertificateType::Unknown(other),
        }
    }
}

impl From<CertificateType> for u16 {
    fn from(value: CertificateType) -> Self {
        match value {
            CertificateType::X509 => 0x0001,
            CertificateType::PkcsSignedData => 0x0002,
            CertificateType::Reserved1 => 0x0003,
            CertificateType::TsStackSigned => 0x0004,
            CertificateType::Unknown(other) => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WinCertificate {
    revision: u16,
    certificate_type: CertificateType,
    certificate: Vec<u8>,
}

impl WinCertificate {
    pub fn from_certificate(certificate: Vec<u8>, certificate_type: CertificateType) -> Self {
        WinCertificate {
            revision: WIN_CERT_REVISION_2_0,
            certificate_type,
            certificate,
        }
    }

    pub fn from_envelope(envelope: &SignatureEnvelope) -> Result<Self> {
        Ok(WinCertificate::from_certificate(
            envelope.to_der()?,
            CertificateType::PkcsSignedData,
        ))
    }

    pub fn revision(&self) -> u16 {
        self.revision
    }

    pub fn certificate_type(&self) -> CertificateType {
        self.certificate_type
    }

    /// Entry payload; for decoded entries this includes any alignment padding.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Size of the encoded entry, header and alignment padding included.
    pub fn encoded_len(&self) -> usize {
        let len = SIZEOF_WIN_CERT_HEADER + self.certificate.len();
        len + padding_for(len, CERT_TABLE_ALIGNMENT)
    }

    /// Encode the entry, `dwLength` covering the zero padding up to the next 8-byte boundary.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = self.encoded_len();
        let dw_length = u32::try_from(length).map_err(|_| {
            crate::error::Error::from(
                WinCertSnafu {
                    reason: format!("entry of {:#x} bytes does not fit dwLength", length),
                }
                .build(),
            )
        })?;
        let mut buf = Vec::with_capacity(length);
        buf.write_u32::<LittleEndian>(dw_length)
            .context(WriteByteSnafu {
                offset: 0usize,
                size: mem::size_of::<u32>(),
            })?;
        buf.write_u16::<LittleEndian>(self.revision)
            .context(WriteByteSnafu {
                offset: 4usize,
                size: mem::size_of::<u16>(),
            })?;
        buf.write_u16::<LittleEndian>(self.certificate_type.into())
            .context(WriteByteSnafu {
                offset: 6usize,
                size: mem::size_of::<u16>(),
            })?;
        buf.extend_from_slice(&self.certificate);
        buf.resize(length, 0);
        Ok(buf)
    }

    /// Decode one entry at the start of `data`, returning it with the offset of the next entry.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut rdr = Cursor::new(data);
        let length = rdr
            .read_u32::<LittleEndian>()
            .context(ReadByteSnafu {
                offset: 0usize,
                size: mem::size_of::<u32>(),
            })?
            as usize;
        let revision = rdr
            .read_u16::<LittleEndian>()
            .context(ReadByteSnafu {
                offset: 4usize,
                size: mem::size_of::<u16>(),
            })?;
        let cert_type = rdr
            .read_u16::<LittleEndian>()
            .context(ReadByteSnafu {
                offset: 6usize,
                size: mem::size_of::<u16>(),
            })?;

        if length < SIZEOF_WIN_CERT_HEADER || length > data.len() {
            WinCertSnafu {
                reason: format!(
                    "dwLength {:#x} out of bounds, {:#x} bytes available",
                    length,
                    data.len()
                ),
            }
            .fail()?
        }
        if revision != WIN_CERT_REVISION_1_0 && revision != WIN_CERT_REVISION_2_0 {
            WinCertSnafu {
                reason: format!("unknown revision {:#06x}", revision),
            }
            .fail()?
        }

        let next = (length + padding_for(length, CERT_TABLE_ALIGNMENT)).min(data.len());
        Ok((
            WinCertificate {
                revision,
                certificate_type: CertificateType::from(cert_type),
                certificate: data[SIZEOF_WIN_CERT_HEADER..length].to_vec(),
            },
            next,
        ))
    }
}

/// Split a certificate table into its entries.
pub fn decode_table(table: &[u8]) -> Result<Vec<WinCertificate>> {
    let mut res = Vec::new();
    let mut begin = 0;
    while begin < table.len() {
        let rest = &table[begin..];
        // trailing zero padding is not an entry
        if rest.len() < SIZEOF_WIN_CERT_HEADER && rest.iter().all(|b| *b == 0) {
            break;
        }
        let (entry, next) = WinCertificate::decode(rest)?;
        debug!(
            "certificate table entry at {:#04x}: {:?}, {:#04x} bytes",
            begin,
            entry.certificate_type(),
            entry.certificate().len()
        );
        res.push(entry);
        begin += next;
    }
    Ok(res)
}

pub fn encode_table(entries: &[WinCertificate]) -> Result<Vec<u8>> {
    let mut table = Vec::new();
    for entry in entries {
        table.extend(entry.encode()?);
    }
    Ok(table)
}

/// Write `entries` as the certificate table of `pe` and refresh the checksum.
///
/// Either both steps land or `pe` is left as it was.
pub fn apply(pe: &mut PeFile, entries: &[WinCertificate]) -> Result<()> {
    let table = encode_table(entries)?;
    let mut staged = pe.clone();
    staged.rewrite_certificate_table(&table)?;
    staged.recompute_checksum()?;
    debug!(
        "certificate table of {} entries, {:#04x} bytes applied",
        entries.len(),
        table.len()
    );
    *pe = staged;
    Ok(())
}

/// Serialize `envelopes` into one entry each and [`apply`] them.
pub fn apply_envelopes(pe: &mut PeFile, envelopes: &[SignatureEnvelope]) -> Result<()> {
    let entries = envelopes
        .iter()
        .map(WinCertificate::from_envelope)
        .collect::<Result<Vec<_>>>()?;
    apply(pe, &entries)
}
