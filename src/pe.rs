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
//! PE/COFF structural model.
//!
//! [`PeFile`] keeps the whole image in a [`ByteChannel`] together with the header
//! offsets needed for signing. Every structural edit is staged on a copy of the
//! channel and re-validated before it replaces the current content.
use crate::channel::{padding_for, ByteChannel};
use crate::digest::{compute_digest, AuthenticodeDigest, DigestAlgorithm};
use crate::envelope::SignatureEnvelope;
use crate::error::{
    CertificateTableSnafu, Error, InvalidMagicInOptHdrSnafu, MissingOptHdrSnafu,
    NoSignatureSnafu, PESnafu, ParseImageSnafu, PersistFileSnafu, ReadFileSnafu, Result,
    VerifySnafu, WriteFileSnafu,
};
use crate::wincert::{self, CertificateType, WinCertificate};
use goblin::pe::data_directories::SIZEOF_DATA_DIRECTORY;
use goblin::pe::header::{PE_MAGIC, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use goblin::pe::optional_header::{
    MAGIC_32, MAGIC_64, SIZEOF_STANDARD_FIELDS_32, SIZEOF_STANDARD_FIELDS_64,
    SIZEOF_WINDOWS_FIELDS_32, SIZEOF_WINDOWS_FIELDS_64,
};
use goblin::pe::PE;
use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const CHECK_SUM_OFFSET: usize = 64; // offset from start of optional header to check sum field
const SIZEOF_CHECKSUM: usize = 4;
const CERTIFICATE_TABLE_INDEX: usize = 4; // index of the certificate table in data directories
pub(crate) const CERT_TABLE_ALIGNMENT: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

/// A byte range of the file, as `offset` and `size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

#[derive(Clone, Debug)]
struct Layout {
    is_64: bool,
    checksum_offset: usize,
    data_directories_end: usize,
    cert_dir_offset: Option<usize>,
    cert_table: Option<Region>,
    sections: Vec<Section>,
}

impl Layout {
    fn parse(channel: &ByteChannel) -> Result<Self> {
        let buf = channel.as_slice();
        let pe = PE::parse(buf).context(PESnafu {})?;
        let pe_pointer = pe.header.dos_header.pe_pointer as usize;

        let signature = channel.read_u32(pe_pointer)?;
        if signature != PE_MAGIC {
            ParseImageSnafu {
                reason: format!(
                    "pe magic check failed expect:{} actual:{}",
                    PE_MAGIC, signature
                ),
            }
            .fail()?
        }

        let hdr = pe.header.optional_header.context(MissingOptHdrSnafu {})?;
        let opt_offset = pe_pointer + SIZEOF_PE_MAGIC + SIZEOF_COFF_HEADER;
        let (is_64, fixed_fields) = match hdr.standard_fields.magic {
            MAGIC_32 => (false, SIZEOF_STANDARD_FIELDS_32 + SIZEOF_WINDOWS_FIELDS_32),
            MAGIC_64 => (true, SIZEOF_STANDARD_FIELDS_64 + SIZEOF_WINDOWS_FIELDS_64),
            _ => InvalidMagicInOptHdrSnafu {
                magic: hdr.standard_fields.magic,
            }
            .fail()?,
        };

        let opt_size = pe.header.coff_header.size_of_optional_header as usize;
        let dd_offset = opt_offset + fixed_fields;
        let dd_count = hdr.windows_fields.number_of_rva_and_sizes as usize;
        let data_directories_end = dd_offset + dd_count * SIZEOF_DATA_DIRECTORY;
        if data_directories_end > opt_offset + opt_size {
            ParseImageSnafu {
                reason: format!(
                    "{} data directories overflow the optional header of {:#x} bytes",
                    dd_count, opt_size
                ),
            }
            .fail()?
        }
        if data_directories_end > buf.len() {
            ParseImageSnafu {
                reason: "data directories run past the end of file",
            }
            .fail()?
        }
        let size_of_headers = hdr.windows_fields.size_of_headers as usize;
        if size_of_headers > buf.len() {
            ParseImageSnafu {
                reason: format!(
                    "size of headers {:#x} larger than file size {:#x}, corrupt headers",
                    size_of_headers,
                    buf.len()
                ),
            }
            .fail()?
        }

        let mut sections = Vec::with_capacity(pe.sections.len());
        for sec in pe.sections.iter() {
            let name = match sec.name() {
                Ok(name) => name.to_string(),
                Err(_) => String::from_utf8_lossy(&sec.name)
                    .trim_end_matches('\0')
                    .to_string(),
            };
            let end = sec.pointer_to_raw_data as usize + sec.size_of_raw_data as usize;
            if sec.size_of_raw_data > 0 && end > buf.len() {
                ParseImageSnafu {
                    reason: format!(
                        "section {} [{:#x} - {:#x}] truncated, file size {:#x}",
                        name,
                        sec.pointer_to_raw_data,
                        end,
                        buf.len()
                    ),
                }
                .fail()?
            }
            sections.push(Section {
                name,
                virtual_address: sec.virtual_address,
                virtual_size: sec.virtual_size,
                pointer_to_raw_data: sec.pointer_to_raw_data,
                size_of_raw_data: sec.size_of_raw_data,
            });
        }

        let cert_dir_offset = if dd_count > CERTIFICATE_TABLE_INDEX {
            Some(dd_offset + CERTIFICATE_TABLE_INDEX * SIZEOF_DATA_DIRECTORY)
        } else {
            None
        };

        let cert_table = match cert_dir_offset {
            Some(offset) => {
                // the "virtual address" of the certificate table is a file offset
                let address = channel.read_u32(offset)? as usize;
                let size = channel.read_u32(offset + 4)? as usize;
                if address == 0 || size == 0 {
                    None
                } else {
                    let region = Region {
                        offset: address,
                        size,
                    };
                    if region.end() > buf.len() {
                        ParseImageSnafu {
                            reason: format!(
                                "certificate table [{:#x} - {:#x}] runs past the end of file {:#x}",
                                region.offset,
                                region.end(),
                                buf.len()
                            ),
                        }
                        .fail()?
                    }
                    if region.offset < size_of_headers {
                        ParseImageSnafu {
                            reason: format!(
                                "certificate table at {:#x} overlaps the headers",
                                region.offset
                            ),
                        }
                        .fail()?
                    }
                    if region.offset % CERT_TABLE_ALIGNMENT != 0 {
                        warn!(
                            "certificate table at {:#x} is not {}-byte aligned",
                            region.offset, CERT_TABLE_ALIGNMENT
                        );
                    }
                    Some(region)
                }
            }
            None => None,
        };

        Ok(Layout {
            is_64,
            checksum_offset: opt_offset + CHECK_SUM_OFFSET,
            data_directories_end,
            cert_dir_offset,
            cert_table,
            sections,
        })
    }
}

/// A PE image held in memory.
#[derive(Clone, Debug)]
pub struct PeFile {
    path: Option<PathBuf>,
    channel: ByteChannel,
    layout: Layout,
}

impl PeFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read(path).context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        let mut pe = PeFile::parse(buf)?;
        pe.path = Some(path.to_path_buf());
        Ok(pe)
    }

    pub fn parse(buf: Vec<u8>) -> Result<Self> {
        let channel = ByteChannel::new(buf);
        let layout = Layout::parse(&channel)?;
        Ok(PeFile {
            path: None,
            channel,
            layout,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.channel.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.channel.into_inner()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub(crate) fn channel(&self) -> &ByteChannel {
        &self.channel
    }

    pub fn is_64(&self) -> bool {
        self.layout.is_64
    }

    pub fn sections(&self) -> &[Section] {
        &self.layout.sections
    }

    pub fn checksum_field_offset(&self) -> usize {
        self.layout.checksum_offset
    }

    /// Offset of the certificate table entry (address and size) in the data directories.
    pub fn certificate_directory_offset(&self) -> Option<usize> {
        self.layout.cert_dir_offset
    }

    pub(crate) fn data_directories_end(&self) -> usize {
        self.layout.data_directories_end
    }

    pub fn certificate_table_region(&self) -> Option<Region> {
        self.layout.cert_table
    }

    pub fn certificate_table(&self) -> Result<Option<&[u8]>> {
        match self.layout.cert_table {
            Some(region) => Ok(Some(self.channel.slice(region.range())?)),
            None => Ok(None),
        }
    }

    pub fn checksum_from_header(&self) -> Result<u32> {
        self.channel.read_u32(self.layout.checksum_offset)
    }

    /// The PE checksum: a folded 16-bit word sum of the file with the checksum
    /// field read as zero, plus the file length.
    pub fn compute_checksum(&self) -> u32 {
        let data = self.channel.as_slice();
        let field = self.layout.checksum_offset..self.layout.checksum_offset + SIZEOF_CHECKSUM;
        let byte_at = |pos: usize| -> u32 {
            match data.get(pos) {
                Some(b) if !field.contains(&pos) => *b as u32,
                _ => 0,
            }
        };

        let mut checksum: u32 = 0;
        for pos in (0..data.len()).step_by(2) {
            let word = byte_at(pos) | (byte_at(pos + 1) << 8);
            let sum = checksum + word;
            checksum = (sum & 0xffff) + (sum >> 16);
        }
        checksum = (checksum & 0xffff) + (checksum >> 16);
        checksum.wrapping_add(data.len() as u32)
    }

    /// Recompute the checksum and patch it into the optional header.
    pub fn recompute_checksum(&mut self) -> Result<u32> {
        let checksum = self.compute_checksum();
        debug!(
            "checksum {:#010x} written at {:#04x}",
            checksum, self.layout.checksum_offset
        );
        self.channel.write_u32(self.layout.checksum_offset, checksum)?;
        Ok(checksum)
    }

    pub fn compute_digest(&self, alg: DigestAlgorithm) -> Result<AuthenticodeDigest> {
        compute_digest(self, alg)
    }

    /// Replace the certificate table with `table` and point the directory entry at it.
    ///
    /// An existing table is replaced where it is, anything behind it moves along.
    /// A new table is appended after zero-padding the file to 8 bytes. An empty
    /// `table` removes the region and zeroes the directory entry. The checksum is
    /// left untouched.
    pub fn rewrite_certificate_table(&mut self, table: &[u8]) -> Result<()> {
        let dir_offset = self.layout.cert_dir_offset.context(CertificateTableSnafu {
            reason: "image has no certificate table directory entry",
        })?;
        let mut staged = self.channel.clone();

        let start = match self.layout.cert_table {
            Some(region) => {
                // an unaligned table moves to the next 8-byte boundary
                let padding = if table.is_empty() {
                    0
                } else {
                    padding_for(region.offset, CERT_TABLE_ALIGNMENT)
                };
                debug!(
                    "replace certificate table [{:#04x} - {:#04x}] with {:#04x} bytes after {} bytes of padding",
                    region.offset,
                    region.end(),
                    table.len(),
                    padding
                );
                let mut data = vec![0u8; padding];
                data.extend_from_slice(table);
                staged.splice(region.range(), &data)?;
                region.offset + padding
            }
            None => {
                if table.is_empty() {
                    return Ok(());
                }
                staged.pad_to(CERT_TABLE_ALIGNMENT);
                let end = staged.len();
                debug!("append certificate table at {:#04x}", end);
                staged.splice(end..end, table)?;
                end
            }
        };

        let (address, size) = if table.is_empty() {
            (0, 0)
        } else {
            let address = u32::try_from(start).map_err(|_| {
                Error::from(
                    CertificateTableSnafu {
                        reason: format!("certificate table offset {:#x} exceeds 4GiB", start),
                    }
                    .build(),
                )
            })?;
            let size = u32::try_from(table.len()).map_err(|_| {
                Error::from(
                    CertificateTableSnafu {
                        reason: format!("certificate table of {:#x} bytes exceeds 4GiB", table.len()),
                    }
                    .build(),
                )
            })?;
            (address, size)
        };
        staged.write_u32(dir_offset, address)?;
        staged.write_u32(dir_offset + 4, size)?;

        let layout = Layout::parse(&staged).map_err(|e| {
            Error::from(
                CertificateTableSnafu {
                    reason: format!("image inconsistent after rewrite: {}", e),
                }
                .build(),
            )
        })?;
        let expected = (!table.is_empty()).then_some(Region {
            offset: start,
            size: table.len(),
        });
        if layout.cert_table != expected {
            CertificateTableSnafu {
                reason: format!(
                    "certificate table directory reads back as {:?}, expected {:?}",
                    layout.cert_table, expected
                ),
            }
            .fail()?
        }

        self.channel = staged;
        self.layout = layout;
        Ok(())
    }

    /// Raw entries of the certificate table in file order.
    pub fn certificate_entries(&self) -> Result<Vec<WinCertificate>> {
        match self.certificate_table()? {
            Some(table) => wincert::decode_table(table),
            None => Ok(Vec::new()),
        }
    }

    /// Embedded signatures in file order, each followed by its nested signatures.
    pub fn signatures(&self) -> Result<Vec<SignatureEnvelope>> {
        let mut res = Vec::new();
        for entry in self.certificate_entries()? {
            if entry.certificate_type() != CertificateType::PkcsSignedData {
                warn!(
                    "skip certificate table entry of type {:?}",
                    entry.certificate_type()
                );
                continue;
            }
            let envelope = SignatureEnvelope::from_der(entry.certificate())?;
            let nested = envelope.nested_signatures()?;
            res.push(envelope);
            res.extend(nested);
        }
        Ok(res)
    }

    /// Check every embedded signature against this image.
    ///
    /// Digests and signature values are checked, certificate chains are not.
    pub fn verify(&self) -> Result<()> {
        let signatures = self.signatures()?;
        if signatures.is_empty() {
            NoSignatureSnafu {}.fail()?
        }
        for (i, sig) in signatures.iter().enumerate() {
            let alg = sig.digest_algorithm()?;
            let digest = self.compute_digest(alg)?;
            if digest.as_bytes() != sig.digest() {
                VerifySnafu {
                    reason: format!(
                        "signature {} digest {:x?} does not match image {} digest {:x?}",
                        i,
                        sig.digest(),
                        alg,
                        digest.as_bytes()
                    ),
                }
                .fail()?
            }
            sig.verify_signature()?;
            debug!("signature {} verified with {}", i, alg);
        }
        Ok(())
    }

    /// Write back to the file this image was opened from.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_as(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "image was not opened from a file",
            ))
            .context(WriteFileSnafu { path: "" })
            .map_err(Into::into),
        }
    }

    /// Write the image through a temporary file in the destination directory,
    /// renamed over `path` once fully flushed.
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut tmp = NamedTempFile::new_in(&dir).context(WriteFileSnafu {
            path: display.clone(),
        })?;
        if let Ok(meta) = fs::metadata(path) {
            tmp.as_file()
                .set_permissions(meta.permissions())
                .context(WriteFileSnafu {
                    path: display.clone(),
                })?;
        }
        tmp.write_all(self.as_bytes()).context(WriteFileSnafu {
            path: display.clone(),
        })?;
        tmp.as_file().sync_all().context(WriteFileSnafu {
            path: display.clone(),
        })?;
        tmp.persist(path).context(PersistFileSnafu { path: display.clone() })?;
        info!("image written to {}, {} bytes", display, self.len());
        Ok(())
    }

    pub fn print_info(&self) -> Result<()> {
        debug!("is 64 bit: {}", self.is_64());
        debug!(
            "checksum in header: {:#010x}, computed: {:#010x}",
            self.checksum_from_header()?,
            self.compute_checksum()
        );
        for sec in self.sections() {
            debug!(
                "section {:<8} raw [{:#x} - {:#x}] virtual {:#x}+{:#x}",
                sec.name,
                sec.pointer_to_raw_data,
                sec.pointer_to_raw_data as u64 + sec.size_of_raw_data as u64,
                sec.virtual_address,
                sec.virtual_size
            );
        }
        match self.certificate_table_region() {
            Some(region) => debug!(
                "certificate table [{:#x} - {:#x}]",
                region.offset,
                region.end()
            ),
            None => debug!("no certificate table"),
        }
        for (i, sig) in self.signatures()?.iter().enumerate() {
            debug!(
                "signature {}: {} digest {:x?}, program name {:?}, {} timestamp(s)",
                i,
                sig.digest_algorithm()?,
                sig.digest(),
                sig.program_name()?,
                sig.timestamp_tokens()?.len()
            );
        }
        Ok(())
    }
}
