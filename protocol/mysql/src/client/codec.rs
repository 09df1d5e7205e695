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

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{err::ProtocolError, mysql_const::MAX_PAYLOAD_LEN, util::get_length};

/// A logical MySQL packet. Payloads larger than `MAX_PAYLOAD_LEN` are
/// reassembled from their continuation packets by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub seq: u8,
    pub payload: BytesMut,
}

impl Packet {
    pub fn header(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Frames packets on a backend connection and tracks the sequence id.
/// The sequence restarts at zero for every command, see `reset_seq`.
#[derive(Debug, Default)]
pub struct PacketCodec {
    seq: u8,
}

impl PacketCodec {
    pub fn new() -> PacketCodec {
        PacketCodec { seq: 0 }
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Make sure the whole logical packet has arrived before consuming anything.
        let mut offset = 0;
        loop {
            if src.len() < offset + 4 {
                return Ok(None);
            }

            let length = get_length(&src[offset..]);
            if src.len() < offset + 4 + length {
                src.reserve(offset + 4 + length - src.len());
                return Ok(None);
            }

            offset += 4 + length;
            if length < MAX_PAYLOAD_LEN {
                break;
            }
        }

        let mut payload = BytesMut::with_capacity(offset);
        let mut seq;
        loop {
            let length = get_length(src);
            seq = src[3];
            src.advance(4);
            payload.extend_from_slice(&src.split_to(length));
            if length < MAX_PAYLOAD_LEN {
                break;
            }
        }

        self.seq = seq.wrapping_add(1);
        Ok(Some(Packet { seq, payload }))
    }
}

impl<'a> Encoder<&'a [u8]> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut chunks = item.chunks(MAX_PAYLOAD_LEN);
        dst.reserve(item.len() + 4 * (item.len() / MAX_PAYLOAD_LEN + 1));

        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            dst.put_uint_le(chunk.len() as u64, 3);
            dst.put_u8(self.seq);
            dst.put_slice(chunk);
            self.seq = self.seq.wrapping_add(1);

            // A payload of exactly MAX_PAYLOAD_LEN is terminated by an empty packet.
            if chunk.len() < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }
}
