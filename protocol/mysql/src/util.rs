// Copyright 2022 SphereEx Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::err::ProtocolError;

// calc_password: Hash password use sha1
pub fn calc_password(scramble: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut crypt = Sha1::new();
    crypt.update(scramble);
    crypt.update(stage2);
    let mut scramble = crypt.finalize().to_vec();

    for i in 0..20 {
        scramble[i] ^= stage1[i]
    }
    scramble
}

// calc_caching_sha2password: Hash password using MySQL 8+ method (SHA256)
pub fn calc_caching_sha2password(scramble: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let mut message1 = Sha256::digest(password).to_vec();
    let message1_hash = Sha256::digest(&message1);

    let mut crypt = Sha256::new();
    crypt.update(message1_hash);
    crypt.update(scramble);
    let message2 = crypt.finalize();

    for i in 0..32 {
        message1[i] ^= message2[i];
    }

    message1
}

#[inline]
pub fn get_length(buf: &[u8]) -> usize {
    LittleEndian::read_u24(buf) as usize
}

/// Bounds-checked readers over a packet payload. Every getter fails with
/// `InvalidPacket` instead of panicking on a truncated packet.
pub trait BufExt: Buf {
    fn get_fixed(&mut self, n: usize) -> Result<Bytes, ProtocolError>;

    fn get_u8_checked(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.get_fixed(1)?[0])
    }

    fn get_u16_le_checked(&mut self) -> Result<u16, ProtocolError> {
        Ok(LittleEndian::read_u16(&self.get_fixed(2)?))
    }

    fn get_u32_le_checked(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(&self.get_fixed(4)?))
    }

    // Returns (value, is_null)
    fn get_lenc_int(&mut self) -> Result<(u64, bool), ProtocolError> {
        match self.get_u8_checked()? {
            0xfb => Ok((0, true)),
            0xfc => Ok((LittleEndian::read_u16(&self.get_fixed(2)?) as u64, false)),
            0xfd => Ok((LittleEndian::read_u24(&self.get_fixed(3)?) as u64, false)),
            0xfe => Ok((LittleEndian::read_u64(&self.get_fixed(8)?), false)),
            x => Ok((x as u64, false)),
        }
    }

    fn get_lenc_bytes(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let (len, is_null) = self.get_lenc_int()?;
        if is_null {
            return Ok(None);
        }
        self.get_fixed(len as usize).map(Some)
    }

    // A missing terminator yields the rest of the buffer, some servers omit it
    // after the auth plugin name.
    fn get_null_terminated(&mut self) -> Result<Bytes, ProtocolError>;
}

impl BufExt for Bytes {
    fn get_fixed(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.len() < n {
            return Err(ProtocolError::invalid_packet("get_fixed", &self[..]));
        }
        Ok(self.split_to(n))
    }

    fn get_null_terminated(&mut self) -> Result<Bytes, ProtocolError> {
        match self.iter().position(|&x| x == 0x00) {
            Some(pos) => {
                let data = self.split_to(pos);
                self.advance(1);
                Ok(data)
            }
            None => Ok(self.split_to(self.len())),
        }
    }
}

pub trait BufMutExt: BufMut {
    fn put_lenc_int(&mut self, n: u64) {
        if n < 251 {
            self.put_u8(n as u8);
        } else if n <= 0xffff {
            self.put_u8(0xfc);
            self.put_uint_le(n, 2);
        } else if n <= 0xffffff {
            self.put_u8(0xfd);
            self.put_uint_le(n, 3);
        } else {
            self.put_u8(0xfe);
            self.put_uint_le(n, 8);
        }
    }
}

impl BufMutExt for Vec<u8> {}
impl BufMutExt for bytes::BytesMut {}
