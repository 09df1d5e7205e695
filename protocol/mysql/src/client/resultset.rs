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

use bytes::Bytes;

use crate::{err::ProtocolError, mysql_const::*, util::BufExt};

/// Outcome of a `COM_QUERY`: either an OK summary or a decoded text result set.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub info: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl QueryResult {
    pub fn is_resultset(&self) -> bool {
        !self.columns.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<OkPacket, ProtocolError> {
        let mut data = Bytes::copy_from_slice(payload);
        if data.get_u8_checked()? != OK_HEADER {
            return Err(ProtocolError::invalid_packet("OkPacket::parse", payload));
        }

        let (affected_rows, _) = data.get_lenc_int()?;
        let (last_insert_id, _) = data.get_lenc_int()?;
        let status = data.get_u16_le_checked()?;
        let warnings = data.get_u16_le_checked()?;
        let info = String::from_utf8_lossy(&data).to_string();

        Ok(OkPacket { affected_rows, last_insert_id, status, warnings, info })
    }
}

impl From<OkPacket> for QueryResult {
    fn from(ok: OkPacket) -> Self {
        QueryResult {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status: ok.status,
            warnings: ok.warnings,
            info: ok.info,
            ..Default::default()
        }
    }
}

// Returns (warnings, status)
pub fn parse_eof(payload: &[u8]) -> Result<(u16, u16), ProtocolError> {
    let mut data = Bytes::copy_from_slice(payload);
    if data.get_u8_checked()? != EOF_HEADER {
        return Err(ProtocolError::invalid_packet("parse_eof", payload));
    }
    // pre-4.1 EOF packets carry no flags
    if data.len() < 4 {
        return Ok((0, 0));
    }
    Ok((data.get_u16_le_checked()?, data.get_u16_le_checked()?))
}

#[inline]
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Turns an `ERR` packet into `ProtocolError::Server`.
pub fn parse_err(payload: &[u8]) -> ProtocolError {
    let mut data = Bytes::copy_from_slice(payload);
    let parsed = (|| -> Result<ProtocolError, ProtocolError> {
        if data.get_u8_checked()? != ERR_HEADER {
            return Err(ProtocolError::invalid_packet("parse_err", payload));
        }
        let code = data.get_u16_le_checked()?;
        let mut state = String::from("HY000");
        if data.first() == Some(&b'#') {
            let _ = data.get_fixed(1)?;
            state = String::from_utf8_lossy(&data.get_fixed(5)?).to_string();
        }
        let message = String::from_utf8_lossy(&data).to_string();
        Ok(ProtocolError::Server { code, state, message })
    })();

    match parsed {
        Ok(err) | Err(err) => err,
    }
}

/// Reads the column name out of a `ColumnDefinition41` packet.
pub fn parse_column_name(payload: &[u8]) -> Result<String, ProtocolError> {
    let mut data = Bytes::copy_from_slice(payload);
    // catalog, schema, table, org_table
    for _ in 0..4 {
        let _ = data.get_lenc_bytes()?;
    }
    let name = data.get_lenc_bytes()?.unwrap_or_default();
    Ok(String::from_utf8_lossy(&name).to_string())
}

pub fn parse_text_row(payload: &[u8], columns: usize) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let mut data = Bytes::copy_from_slice(payload);
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        row.push(data.get_lenc_bytes()?);
    }
    Ok(row)
}
