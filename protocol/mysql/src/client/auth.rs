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

use bytes::{BufMut, Bytes};

use crate::{
    client::resultset::parse_err,
    err::ProtocolError,
    mysql_const::*,
    util::{calc_caching_sha2password, calc_password, BufExt},
};

/// Fields of the server's `HandshakeV10` packet that the client needs.
#[derive(Debug, Default, Clone)]
pub struct Handshake {
    pub server_version: String,
    pub connection_id: u32,
    pub salt: Vec<u8>,
    pub capability: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin_name: String,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> Result<Handshake, ProtocolError> {
        let mut data = Bytes::copy_from_slice(payload);

        let version = data.get_u8_checked()?;
        if version == ERR_HEADER {
            return Err(parse_err(payload));
        }
        if version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::ProtocolVersion(version));
        }

        let server_version = String::from_utf8_lossy(&data.get_null_terminated()?).to_string();
        let connection_id = data.get_u32_le_checked()?;

        let mut salt = data.get_fixed(8)?.to_vec();
        // filler
        let _ = data.get_fixed(1)?;

        let mut capability = data.get_u16_le_checked()? as u32;
        if capability & CLIENT_PROTOCOL_41 == 0 {
            return Err(ProtocolError::ServerProtocolVersion);
        }

        let mut hs = Handshake {
            server_version,
            connection_id,
            capability,
            auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
            ..Default::default()
        };

        if data.is_empty() {
            hs.salt = salt;
            return Ok(hs);
        }

        hs.charset = data.get_u8_checked()?;
        hs.status = data.get_u16_le_checked()?;
        capability |= (data.get_u16_le_checked()? as u32) << 16;
        hs.capability = capability;

        let auth_data_len = data.get_u8_checked()? as usize;
        // reserved
        let _ = data.get_fixed(10)?;

        if capability & CLIENT_SECURE_CONNECTION != 0 {
            let rest = std::cmp::max(13, auth_data_len.saturating_sub(8));
            let part2 = data.get_fixed(rest)?;
            // drop the trailing 0x00
            salt.extend_from_slice(&part2[..rest - 1]);
        }
        hs.salt = salt;

        if capability & CLIENT_PLUGIN_AUTH != 0 {
            let name = data.get_null_terminated()?;
            if !name.is_empty() {
                hs.auth_plugin_name = String::from_utf8_lossy(&name).to_string();
            }
        }

        Ok(hs)
    }
}

// gen_auth_response: scramble password according to auth plugin.
pub fn gen_auth_response(plugin: &str, salt: &[u8], password: &str) -> Result<Vec<u8>, ProtocolError> {
    match plugin {
        AUTH_NATIVE_PASSWORD => {
            let salt = if salt.len() > 20 { &salt[..20] } else { salt };
            Ok(calc_password(salt, password.as_bytes()))
        }
        AUTH_CACHING_SHA2_PASSWORD => Ok(calc_caching_sha2password(salt, password.as_bytes())),
        plugin => Err(ProtocolError::AuthPluginUnsupport(plugin.to_string())),
    }
}

/// Builds `HandshakeResponse41`.
pub fn build_handshake_response(
    hs: &Handshake,
    user: &str,
    password: &str,
    db: &str,
) -> Result<Vec<u8>, ProtocolError> {
    let mut capability = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_TRANSACTIONS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_MULTI_RESULTS
        | hs.capability & CLIENT_LONG_FLAG;
    if !db.is_empty() {
        capability |= CLIENT_CONNECT_WITH_DB;
    }

    let auth = gen_auth_response(&hs.auth_plugin_name, &hs.salt, password)?;

    let mut data: Vec<u8> = Vec::with_capacity(64 + user.len() + db.len() + auth.len());
    data.put_u32_le(capability);
    // max packet size
    data.put_u32_le(MAX_PAYLOAD_LEN as u32);
    data.put_u8(DEFAULT_COLLATION_ID);
    data.put_bytes(0, 23);

    data.put_slice(user.as_bytes());
    data.put_u8(0);

    data.put_u8(auth.len() as u8);
    data.put_slice(&auth);

    if !db.is_empty() {
        data.put_slice(db.as_bytes());
        data.put_u8(0);
    }

    data.put_slice(hs.auth_plugin_name.as_bytes());
    data.put_u8(0);

    Ok(data)
}

/// What the server answered to an auth packet.
#[derive(Debug, PartialEq)]
pub enum AuthReply {
    Ok,
    // caching_sha2 cache hit, an OK packet follows
    FastAuthSuccess,
    Switch { plugin: String, salt: Vec<u8> },
}

pub fn parse_auth_reply(payload: &[u8]) -> Result<AuthReply, ProtocolError> {
    let mut data = Bytes::copy_from_slice(payload);
    match data.get_u8_checked()? {
        OK_HEADER => Ok(AuthReply::Ok),

        ERR_HEADER => match parse_err(payload) {
            ProtocolError::Server { code, message, .. } => {
                Err(ProtocolError::AuthFailed { code, message })
            }
            e => Err(e),
        },

        AUTH_SWITCH_HEADER => {
            let plugin = String::from_utf8_lossy(&data.get_null_terminated()?).to_string();
            let mut salt = data.to_vec();
            if salt.last() == Some(&0x00) {
                salt.pop();
            }
            Ok(AuthReply::Switch { plugin, salt })
        }

        MORE_DATA_HEADER => match data.get_u8_checked()? {
            CACHE_SHA2_FAST_AUTH => Ok(AuthReply::FastAuthSuccess),
            CACHE_SHA2_FULL_AUTH => Err(ProtocolError::AuthPluginUnsupport(format!(
                "{} full authentication requires TLS or RSA",
                AUTH_CACHING_SHA2_PASSWORD
            ))),
            _ => Err(ProtocolError::invalid_packet("parse_auth_reply", payload)),
        },

        _ => Err(ProtocolError::invalid_packet("parse_auth_reply", payload)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handshake_packet(plugin: &str) -> Vec<u8> {
        let mut data = vec![10];
        data.extend_from_slice(b"8.0.28\0");
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        let cap = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        data.extend_from_slice(&(cap as u16).to_le_bytes());
        data.push(45);
        data.extend_from_slice(&SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
        data.extend_from_slice(&((cap >> 16) as u16).to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(plugin.as_bytes());
        data.push(0);
        data
    }

    #[test]
    fn test_parse_handshake() {
        let hs = Handshake::parse(&handshake_packet(AUTH_CACHING_SHA2_PASSWORD)).unwrap();
        assert_eq!(hs.server_version, "8.0.28");
        assert_eq!(hs.connection_id, 7);
        assert_eq!(hs.salt, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(hs.auth_plugin_name, AUTH_CACHING_SHA2_PASSWORD);
        assert_eq!(hs.status, SERVER_STATUS_AUTOCOMMIT);
    }

    #[test]
    fn test_parse_truncated_handshake() {
        let packet = handshake_packet(AUTH_NATIVE_PASSWORD);
        assert!(matches!(
            Handshake::parse(&packet[..30]),
            Err(ProtocolError::InvalidPacket { .. })
        ));
    }

    #[test]
    fn test_handshake_response_layout() {
        let hs = Handshake::parse(&handshake_packet(AUTH_NATIVE_PASSWORD)).unwrap();
        let data = build_handshake_response(&hs, "root", "secret", "app").unwrap();
        let cap = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert!(cap & CLIENT_CONNECT_WITH_DB != 0);
        assert_eq!(&data[32..37], b"root\0");
        assert_eq!(data[37], 20);
        assert!(data.ends_with(b"app\0mysql_native_password\0"));
    }

    #[test]
    fn test_auth_reply() {
        assert_eq!(parse_auth_reply(&[0x00, 0x00, 0x00, 0x02, 0x00]).unwrap(), AuthReply::Ok);
        assert_eq!(parse_auth_reply(&[0x01, 0x03]).unwrap(), AuthReply::FastAuthSuccess);
        assert!(matches!(
            parse_auth_reply(&[0x01, 0x04]),
            Err(ProtocolError::AuthPluginUnsupport(_))
        ));

        let mut switch = vec![0xfe];
        switch.extend_from_slice(b"mysql_native_password\0salt\0");
        assert_eq!(
            parse_auth_reply(&switch).unwrap(),
            AuthReply::Switch { plugin: AUTH_NATIVE_PASSWORD.to_string(), salt: b"salt".to_vec() }
        );

        let mut err = vec![0xff, 0x15, 0x04, b'#'];
        err.extend_from_slice(b"28000Access denied");
        assert!(matches!(
            parse_auth_reply(&err),
            Err(ProtocolError::AuthFailed { code: 1045, .. })
        ));
    }
}
