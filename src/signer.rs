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
//! Signing pipeline: digest, envelope, timestamp, certificate table.
use crate::config::{SignOptions, SignaturePolicy};
use crate::envelope::{SignatureBuilder, SignatureEnvelope};
use crate::error::Result;
use crate::identity::SigningIdentity;
use crate::pe::PeFile;
use crate::timestamp::Timestamper;
use crate::wincert::{self, CertificateType, WinCertificate};
use log::{debug, info};
use std::path::Path;

pub struct PeSigner<'a> {
    identity: SigningIdentity<'a>,
    options: SignOptions,
    timestamper: Option<Timestamper>,
}

impl<'a> PeSigner<'a> {
    /// A signer for `identity`; an HTTP timestamper is set up when `options` asks for one.
    pub fn new(identity: SigningIdentity<'a>, options: SignOptions) -> Result<Self> {
        let timestamper = options
            .timestamp
            .clone()
            .map(Timestamper::new)
            .transpose()?;
        Ok(PeSigner {
            identity,
            options,
            timestamper,
        })
    }

    /// Timestamp with `timestamper` instead of the configured one.
    pub fn with_timestamper(mut self, timestamper: Timestamper) -> Self {
        self.timestamper = Some(timestamper);
        self
    }

    pub fn options(&self) -> &SignOptions {
        &self.options
    }

    pub fn identity(&self) -> &SigningIdentity<'a> {
        &self.identity
    }

    /// Sign `pe` in memory and return the new signature.
    ///
    /// `pe` is only modified once every step has succeeded.
    pub fn sign(&self, pe: &mut PeFile) -> Result<SignatureEnvelope> {
        let digest = pe.compute_digest(self.options.digest_algorithm)?;
        debug!(
            "image {} digest {:x?}",
            digest.algorithm(),
            digest.as_bytes()
        );
        let mut envelope = SignatureBuilder::new(&self.identity)
            .program_name(self.options.program_name.as_deref())
            .program_url(self.options.program_url.as_deref())
            .build(digest)?;

        if let Some(timestamper) = &self.timestamper {
            envelope = timestamper.timestamp(&envelope)?;
        }

        let mut entries = match self.options.policy {
            SignaturePolicy::Add => {
                let existing = pe.certificate_entries()?;
                info!("add signature after {} existing entries", existing.len());
                existing
            }
            SignaturePolicy::Replace => {
                info!("replace existing signatures");
                Vec::new()
            }
        };
        entries.push(WinCertificate::from_envelope(&envelope)?);
        wincert::apply(pe, &entries)?;
        Ok(envelope)
    }

    /// Sign the image at `input`, writing it to `output` or back to `input`.
    pub fn sign_file<P: AsRef<Path>>(
        &self,
        input: P,
        output: Option<&Path>,
    ) -> Result<SignatureEnvelope> {
        let mut pe = PeFile::open(input)?;
        let envelope = self.sign(&mut pe)?;
        match output {
            Some(path) => pe.save_as(path)?,
            None => pe.save()?,
        }
        Ok(envelope)
    }
}

/// Timestamp every signature of `pe` that has none yet, returning how many were stamped.
pub fn timestamp_signatures(pe: &mut PeFile, timestamper: &Timestamper) -> Result<usize> {
    let mut entries = pe.certificate_entries()?;
    let mut stamped = 0;
    for entry in entries.iter_mut() {
        if entry.certificate_type() != CertificateType::PkcsSignedData {
            continue;
        }
        let envelope = SignatureEnvelope::from_der(entry.certificate())?;
        if !envelope.timestamp_tokens()?.is_empty() {
            debug!("signature already timestamped, skipped");
            continue;
        }
        let envelope = timestamper.timestamp(&envelope)?;
        *entry = WinCertificate::from_envelope(&envelope)?;
        stamped += 1;
    }
    if stamped > 0 {
        wincert::apply(pe, &entries)?;
    }
    info!("{} signature(s) timestamped", stamped);
    Ok(stamped)
}

/// Drop the certificate table and refresh the checksum.
pub fn remove_signatures(pe: &mut PeFile) -> Result<()> {
    wincert::apply(pe, &[])?;
    info!("signatures removed");
    Ok(())
}

/// Embedded signatures, nested ones included; `pe` is not modified.
pub fn read_signatures(pe: &PeFile) -> Result<Vec<SignatureEnvelope>> {
    pe.signatures()
}
