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
//! Random access over the image bytes.
//!
//! The whole image is held in one addressable buffer; every structural edit is
//! applied against offsets into it and the result is committed in one write.
use crate::error::{ReadByteSnafu, Result, WriteByteSnafu};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use snafu::ResultExt;
use std::io::{self, Cursor};
use std::mem;
use std::ops::Range;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteChannel {
    buf: Vec<u8>,
}

impl ByteChannel {
    pub fn new(buf: Vec<u8>) -> Self {
        ByteChannel { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut rdr = Cursor::new(&self.buf);
        rdr.set_position(offset as u64);
        rdr.read_u32::<LittleEndian>()
            .context(ReadByteSnafu {
                offset,
                size: mem::size_of::<u32>(),
            })
            .map_err(Into::into)
    }

    /// Borrow `range`, failing instead of panicking when it runs past the end.
    pub fn slice(&self, range: Range<usize>) -> Result<&[u8]> {
        let size = range.end.saturating_sub(range.start);
        match self.buf.get(range.clone()) {
            Some(s) => Ok(s),
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                .context(ReadByteSnafu {
                    offset: range.start,
                    size,
                })
                .map_err(Into::into),
        }
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let size = mem::size_of::<u32>();
        let len = self.buf.len();
        let mut slot = match self.buf.get_mut(offset..offset.saturating_add(size)) {
            Some(s) => s,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("channel holds only {} bytes", len),
                ))
                .context(WriteByteSnafu { offset, size })
                .map_err(Into::into)
            }
        };
        slot.write_u32::<LittleEndian>(value)
            .context(WriteByteSnafu { offset, size })?;
        Ok(())
    }

    /// Replace `range` with `data`, growing or shrinking the buffer.
    pub fn splice(&mut self, range: Range<usize>, data: &[u8]) -> Result<()> {
        if range.start > range.end || range.end > self.buf.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                .context(WriteByteSnafu {
                    offset: range.start,
                    size: data.len(),
                })
                .map_err(Into::into);
        }
        debug!(
            "splice [{:#04x} - {:#04x}] with {:#04x} bytes",
            range.start, range.end, data.len()
        );
        self.buf.splice(range, data.iter().cloned());
        Ok(())
    }

    /// Zero-pad the end of the buffer to a multiple of `align`, returning the padding size.
    pub fn pad_to(&mut self, align: usize) -> usize {
        let padding = padding_for(self.buf.len(), align);
        if padding > 0 {
            debug!("zero-pad {} bytes", padding);
            self.buf.resize(self.buf.len() + padding, 0);
        }
        padding
    }
}

/// Bytes needed to bring `len` up to a multiple of `align`.
pub fn padding_for(len: usize, align: usize) -> usize {
    (align - len % align) % align
}
