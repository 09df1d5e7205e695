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

use std::io;

use thiserror::Error;

use crate::mysql_const::*;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("unsupport protocol version {0}")]
    ProtocolVersion(u8),

    #[error("mysql server can not support protocol 41 and above required by the client")]
    ServerProtocolVersion,

    #[error("method: {:?} invalid packet {:?}", .method, .data)]
    InvalidPacket { method: String, data: Vec<u8> },

    #[error("auth failed: ERROR {code}: {message}")]
    AuthFailed { code: u16, message: String },

    #[error("unsupport auth plugin {0:?}")]
    AuthPluginUnsupport(String),

    #[error("stdio error: {0:?}")]
    Io(#[from] io::Error),

    #[error("connection closed by server")]
    UnexpectedEof,

    #[error("connection is not established")]
    NotConnected,

    #[error("ERROR {code} ({state}): {message}")]
    Server { code: u16, state: String, message: String },
}

impl ProtocolError {
    pub fn invalid_packet(method: &str, data: &[u8]) -> ProtocolError {
        ProtocolError::InvalidPacket { method: method.to_string(), data: data.to_vec() }
    }

    /// Whether the connection that produced this error can no longer be trusted.
    /// A server `ERR` packet is a complete response, so the connection stays in
    /// sync unless the code says the server session itself has ended.
    pub fn is_conn_broken(&self) -> bool {
        match self {
            ProtocolError::Server { code, .. } => matches!(
                *code,
                ER_SERVER_SHUTDOWN
                    | ER_NET_READ_ERROR
                    | ER_NET_WRITE_ERROR
                    | ER_CONNECTION_KILLED
                    | ER_SESSION_WAS_KILLED
            ),
            _ => true,
        }
    }
}
