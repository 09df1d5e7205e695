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

use std::io::Error as IoError;

use conn_pool::PoolError;
use mysql_protocol::err::ProtocolError;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ErrorKind {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("no backend instance available in {0}")]
    NoInstance(String),

    #[error("stdio error: {0:?}")]
    Io(#[from] IoError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("backend connection lost while autocommit was disabled, set autocommit again")]
    AutocommitLost,
}

#[derive(Debug, ThisError)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::new(ErrorKind::Protocol(e))
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::new(ErrorKind::Pool(e))
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    // A connection that produced a broken error must be closed, never pooled.
    pub fn is_conn_broken(&self) -> bool {
        match &self.kind {
            ErrorKind::Protocol(e) => e.is_conn_broken(),
            ErrorKind::Io(_) => true,
            ErrorKind::Pool(_)
            | ErrorKind::NoInstance(_)
            | ErrorKind::Internal(_)
            | ErrorKind::SessionClosed
            | ErrorKind::AutocommitLost => false,
        }
    }
}
