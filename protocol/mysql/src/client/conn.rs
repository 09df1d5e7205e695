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

use async_trait::async_trait;
use conn_pool::{ConnAttr, ConnLike};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::{
    auth::{build_handshake_response, gen_auth_response, parse_auth_reply, AuthReply, Handshake},
    codec::{Packet, PacketCodec},
    resultset::{
        is_eof_packet, parse_column_name, parse_eof, parse_err, parse_text_row, OkPacket,
        QueryResult,
    },
};
use crate::{err::ProtocolError, mysql_const::*, util::BufExt};

/// A single authenticated connection to a MySQL backend.
///
/// A `ClientConn` built with `with_opts` is only a template: it carries the
/// credentials and endpoint, `connect` (or `ConnLike::build_conn`) returns a
/// live connection.
#[derive(Debug, Default)]
pub struct ClientConn {
    framed: Option<Framed<TcpStream, PacketCodec>>,
    user: String,
    password: String,
    endpoint: String,
    default_db: String,
    // schema currently selected on the server side
    db: Option<String>,
    status: u16,
    connection_id: u32,
}

impl ClientConn {
    pub fn with_opts(user: String, password: String, endpoint: String) -> ClientConn {
        ClientConn { user, password, endpoint, ..Default::default() }
    }

    pub fn with_db(mut self, db: String) -> ClientConn {
        self.default_db = db;
        self
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_autocommit(&self) -> bool {
        self.status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn in_trans(&self) -> bool {
        self.status & SERVER_STATUS_IN_TRANS != 0
    }

    pub async fn connect(&self) -> Result<ClientConn, ProtocolError> {
        let sock = TcpStream::connect(&self.endpoint).await?;
        sock.set_nodelay(true)?;

        let mut conn = ClientConn {
            framed: Some(Framed::with_capacity(sock, PacketCodec::new(), 16384)),
            user: self.user.clone(),
            password: self.password.clone(),
            endpoint: self.endpoint.clone(),
            default_db: self.default_db.clone(),
            ..Default::default()
        };

        conn.handshake().await?;
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<(), ProtocolError> {
        let packet = self.read_packet().await?;
        let hs = Handshake::parse(&packet.payload)?;
        self.connection_id = hs.connection_id;
        self.status = hs.status;

        let resp = build_handshake_response(&hs, &self.user, &self.password, &self.default_db)?;
        self.write_packet(&resp).await?;

        let mut plugin = hs.auth_plugin_name.clone();
        loop {
            let packet = self.read_packet().await?;
            match parse_auth_reply(&packet.payload)? {
                AuthReply::Ok => break,

                AuthReply::FastAuthSuccess => {}

                AuthReply::Switch { plugin: next, salt } => {
                    debug!(endpoint = %self.endpoint, plugin = %next, "auth switch");
                    let data = gen_auth_response(&next, &salt, &self.password)?;
                    plugin = next;
                    self.write_packet(&data).await?;
                }
            }
        }

        if !self.default_db.is_empty() {
            self.db = Some(self.default_db.clone());
        }

        debug!(
            endpoint = %self.endpoint,
            connection_id = self.connection_id,
            plugin = %plugin,
            "backend connection established"
        );
        Ok(())
    }

    fn framed_mut(&mut self) -> Result<&mut Framed<TcpStream, PacketCodec>, ProtocolError> {
        self.framed.as_mut().ok_or(ProtocolError::NotConnected)
    }

    async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        match self.framed_mut()?.next().await {
            Some(res) => res,
            None => Err(ProtocolError::UnexpectedEof),
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.framed_mut()?.send(data).await
    }

    async fn write_command(&mut self, cmd: u8, arg: &[u8]) -> Result<(), ProtocolError> {
        let framed = self.framed_mut()?;
        framed.codec_mut().reset_seq();

        let mut data = Vec::with_capacity(arg.len() + 1);
        data.push(cmd);
        data.extend_from_slice(arg);
        framed.send(&data[..]).await
    }

    // Reads an OK or ERR reply.
    async fn read_ok(&mut self) -> Result<OkPacket, ProtocolError> {
        let packet = self.read_packet().await?;
        match packet.header() {
            Some(OK_HEADER) => {
                let ok = OkPacket::parse(&packet.payload)?;
                self.status = ok.status;
                Ok(ok)
            }
            Some(ERR_HEADER) => Err(parse_err(&packet.payload)),
            _ => Err(ProtocolError::invalid_packet("read_ok", &packet.payload)),
        }
    }

    /// Runs a text protocol query. Only the first result of a multi result
    /// response is returned, the rest are drained.
    ///
    /// The statement may switch schema (`USE`), so the cached schema is
    /// forgotten and the next `use_db` always reaches the server.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult, ProtocolError> {
        self.db = None;
        self.run_query(sql).await
    }

    async fn run_query(&mut self, sql: &str) -> Result<QueryResult, ProtocolError> {
        self.write_command(COM_QUERY, sql.as_bytes()).await?;

        let first = self.read_result().await?;
        while self.status & SERVER_MORE_RESULTS_EXISTS != 0 {
            self.read_result().await?;
        }
        Ok(first)
    }

    async fn read_result(&mut self) -> Result<QueryResult, ProtocolError> {
        let packet = self.read_packet().await?;
        match packet.header() {
            Some(OK_HEADER) => {
                let ok = OkPacket::parse(&packet.payload)?;
                self.status = ok.status;
                return Ok(ok.into());
            }
            Some(ERR_HEADER) => {
                self.status &= !SERVER_MORE_RESULTS_EXISTS;
                return Err(parse_err(&packet.payload));
            }
            Some(LOCAL_IN_FILE_HEADER) => {
                return Err(ProtocolError::invalid_packet("LOAD DATA LOCAL", &packet.payload))
            }
            _ => {}
        }

        let mut data = packet.payload.freeze();
        let (count, _) = data.get_lenc_int()?;
        let count = count as usize;

        let mut result = QueryResult { columns: Vec::with_capacity(count), ..Default::default() };
        for _ in 0..count {
            let packet = self.read_packet().await?;
            result.columns.push(parse_column_name(&packet.payload)?);
        }

        let packet = self.read_packet().await?;
        if !is_eof_packet(&packet.payload) {
            return Err(ProtocolError::invalid_packet("read_result", &packet.payload));
        }

        loop {
            let packet = self.read_packet().await?;
            match packet.header() {
                Some(ERR_HEADER) => {
                    self.status &= !SERVER_MORE_RESULTS_EXISTS;
                    return Err(parse_err(&packet.payload));
                }
                _ if is_eof_packet(&packet.payload) => {
                    let (warnings, status) = parse_eof(&packet.payload)?;
                    self.status = status;
                    result.warnings = warnings;
                    result.status = status;
                    return Ok(result);
                }
                _ => result.rows.push(parse_text_row(&packet.payload, count)?),
            }
        }
    }

    /// Selects the schema, skipped when the connection is already on it.
    pub async fn use_db(&mut self, db: &str) -> Result<(), ProtocolError> {
        if db.is_empty() || self.db.as_deref() == Some(db) {
            return Ok(());
        }

        self.write_command(COM_INIT_DB, db.as_bytes()).await?;
        self.read_ok().await?;
        self.db = Some(db.to_string());
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(), ProtocolError> {
        self.write_command(COM_PING, &[]).await?;
        self.read_ok().await.map(|_| ())
    }

    pub async fn begin(&mut self) -> Result<(), ProtocolError> {
        self.run_query("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self) -> Result<(), ProtocolError> {
        self.run_query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> Result<(), ProtocolError> {
        self.run_query("ROLLBACK").await.map(|_| ())
    }

    pub async fn set_autocommit(&mut self, on: bool) -> Result<(), ProtocolError> {
        let sql = if on { "SET autocommit = 1" } else { "SET autocommit = 0" };
        self.run_query(sql).await.map(|_| ())
    }

    // Sends COM_QUIT and drops the socket.
    pub async fn quit(&mut self) -> Result<(), ProtocolError> {
        let res = if self.framed.is_some() {
            self.write_command(COM_QUIT, &[]).await
        } else {
            Ok(())
        };
        self.framed = None;
        res
    }
}

#[async_trait]
impl ConnLike for ClientConn {
    type Error = ProtocolError;

    async fn build_conn(&self) -> Result<ClientConn, ProtocolError> {
        self.connect().await
    }

    async fn close(mut self) -> Result<(), ProtocolError> {
        self.quit().await
    }
}

impl ConnAttr for ClientConn {
    fn get_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn get_db(&self) -> Option<String> {
        self.db.clone()
    }

    fn get_autocommit(&self) -> Option<bool> {
        self.framed.as_ref().map(|_| self.is_autocommit())
    }
}
