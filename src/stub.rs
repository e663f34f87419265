//! In-memory stand-in for a MongoDB server.
//!
//! Speaks enough of the legacy protocol to replay captured traffic in tests
//! and benchmarks: inserts are stored per namespace, queries match documents
//! by field equality, and getmores page through server-side cursors whose
//! ids never coincide with the ones a capture would carry. A stub can also
//! demand SCRAM-SHA-256 authentication before it serves a connection.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use parking_lot::Mutex;
use scram::{hash_password, AuthenticationProvider, AuthenticationStatus, PasswordInfo, ScramServer};
use tokio::io::DuplexStream;
use tracing::{debug, trace, warn};

use crate::network::{Connector, WireConnection};
use crate::wire::{
    build, read_cstr, read_document, read_i32, OpCode, OpKind, RawOp, HEADER_LEN,
    REPLY_CURSOR_NOT_FOUND, REPLY_QUERY_FAILURE,
};
use crate::{ReplayError, Result};

/// Batch size used when a request leaves `numberToReturn` at 0
pub const DEFAULT_BATCH: usize = 101;

/// First cursor id handed out by a stub server
const CURSOR_ID_BASE: i64 = 0x5eed_0000_0000;

/// Gap between consecutive stub cursor ids
const CURSOR_ID_STRIDE: i64 = 7919;

/// Capacity of each in-memory pipe
const PIPE_CAPACITY: usize = 64 * 1024;

/// PBKDF2 rounds used for the stub user's password
const SCRAM_ITERATIONS: u16 = 4096;

const SCRAM_SALT: &[u8] = b"mongotape-stub-salt";

/// Server error code for requests on an unauthenticated connection
const UNAUTHORIZED: i32 = 13;

/// The one user an authenticating stub accepts
#[derive(Clone)]
struct StubUser {
    username: String,
    password: String,
}

impl AuthenticationProvider for StubUser {
    fn get_password_for(&self, username: &str) -> Option<PasswordInfo> {
        if username != self.username {
            return None;
        }
        let iterations = NonZeroU32::new(u32::from(SCRAM_ITERATIONS))?;
        let hashed = hash_password(&self.password, iterations, SCRAM_SALT);
        Some(PasswordInfo::new(
            hashed.to_vec(),
            SCRAM_ITERATIONS,
            SCRAM_SALT.to_vec(),
        ))
    }
}

fn is_command(op: &RawOp, name: &str) -> bool {
    op.op_code() == OpCode::Query && op.command_name().as_deref() == Some(name)
}

fn sasl_payload(op: &RawOp) -> Result<String> {
    let command = op.query_document()?;
    let bytes = command
        .get_binary_generic("payload")
        .map_err(|e| ReplayError::InvalidFrame(format!("SASL command without payload: {e}")))?;
    String::from_utf8(bytes.clone())
        .map_err(|e| ReplayError::InvalidFrame(format!("SASL payload is not UTF-8: {e}")))
}

fn sasl_step(done: bool, message: String) -> Document {
    doc! {
        "conversationId": 1,
        "done": done,
        "payload": Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: message.into_bytes(),
        }),
        "ok": 1.0,
    }
}

fn auth_failed() -> Document {
    doc! { "ok": 0.0, "errmsg": "Authentication failed.", "code": 18 }
}

struct StubState {
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, VecDeque<Document>>,
    next_cursor: i64,
    next_request_id: i32,
    received: Vec<RawOp>,
    connections: usize,
    refuse_connections: bool,
    silent: bool,
    user: Option<StubUser>,
    authentications: usize,
}

impl StubState {
    fn next_request_id(&mut self) -> i32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    fn allocate_cursor(&mut self) -> i64 {
        self.next_cursor += CURSOR_ID_STRIDE;
        self.next_cursor
    }

    fn insert(&mut self, op: &RawOp) -> Result<()> {
        let body = &op.as_bytes()[HEADER_LEN..];
        let (ns, mut pos) = read_cstr(body, 4)?;
        let ns = ns.to_string();

        let mut docs = Vec::new();
        while pos < body.len() {
            let (doc, next) = read_document(body, pos)?;
            docs.push(doc);
            pos = next;
        }

        trace!("Stub stored {} documents in {ns}", docs.len());
        self.collections.entry(ns).or_default().extend(docs);
        Ok(())
    }

    fn command(&mut self, op: &RawOp) -> Result<RawOp> {
        let name = op.command_name().unwrap_or_default();
        let answer = if name.eq_ignore_ascii_case("getLastError") {
            doc! { "n": 0, "err": Bson::Null, "ok": 1.0 }
        } else {
            doc! { "ok": 1.0 }
        };

        let request_id = self.next_request_id();
        build::reply(request_id, op.header().request_id, 0, 0, 0, &[answer])
    }

    fn query(&mut self, op: &RawOp) -> Result<RawOp> {
        let body = &op.as_bytes()[HEADER_LEN..];
        let (ns, next) = read_cstr(body, 4)?;
        let skip = usize::try_from(read_i32(body, next)?).unwrap_or(0);
        let limit = read_i32(body, next + 4)?;
        let (query, _) = read_document(body, next + 8)?;

        let filter = match query.get("$query") {
            Some(Bson::Document(inner)) => inner.clone(),
            _ => query.clone(),
        };

        let matched: VecDeque<Document> = self
            .collections
            .get(ns)
            .into_iter()
            .flatten()
            .filter(|doc| matches_filter(doc, &filter))
            .skip(skip)
            .cloned()
            .collect();

        debug!("Stub query on {ns} matched {} documents", matched.len());
        self.batch(op.header().request_id, matched, limit, None)
    }

    fn get_more(&mut self, op: &RawOp) -> Result<RawOp> {
        let body = &op.as_bytes()[HEADER_LEN..];
        let (_, next) = read_cstr(body, 4)?;
        let limit = read_i32(body, next)?;
        let cursor_id = op.cursor_ids()?.first().copied().unwrap_or_default();

        match self.cursors.remove(&cursor_id) {
            Some(remaining) => self.batch(op.header().request_id, remaining, limit, Some(cursor_id)),
            None => {
                debug!("Stub getmore on unknown cursor {cursor_id}");
                let request_id = self.next_request_id();
                build::reply(
                    request_id,
                    op.header().request_id,
                    REPLY_CURSOR_NOT_FOUND,
                    0,
                    0,
                    &[],
                )
            }
        }
    }

    /// Answer with the next batch of `docs`, keeping a cursor open for the rest
    fn batch(
        &mut self,
        response_to: i32,
        mut docs: VecDeque<Document>,
        limit: i32,
        cursor: Option<i64>,
    ) -> Result<RawOp> {
        let (size, single_batch) = batch_limit(limit);
        let taken: Vec<Document> = docs.drain(..size.min(docs.len())).collect();

        let cursor_id = if single_batch || docs.is_empty() {
            0
        } else {
            let id = match cursor {
                Some(id) => id,
                None => self.allocate_cursor(),
            };
            self.cursors.insert(id, docs);
            id
        };

        let request_id = self.next_request_id();
        build::reply(request_id, response_to, 0, cursor_id, 0, &taken)
    }

    /// Refuse a request that arrived before the connection authenticated
    fn unauthorized(&mut self, op: &RawOp) -> Result<Option<RawOp>> {
        self.received.push(op.clone());
        let request_id = self.next_request_id();
        let response_to = op.header().request_id;
        let refusal = doc! {
            "ok": 0.0,
            "errmsg": "command requires authentication",
            "code": UNAUTHORIZED,
        };

        match op.op_code() {
            OpCode::Query | OpCode::GetMore => build::reply(
                request_id,
                response_to,
                REPLY_QUERY_FAILURE,
                0,
                0,
                &[doc! { "$err": "not authorized", "code": UNAUTHORIZED }],
            )
            .map(Some),
            OpCode::Command => build::command_reply(request_id, response_to, &refusal).map(Some),
            OpCode::Msg => build::msg(request_id, response_to, &refusal).map(Some),
            _ => Ok(None),
        }
    }

    fn handle(&mut self, op: &RawOp) -> Result<Option<RawOp>> {
        self.received.push(op.clone());
        let response_to = op.header().request_id;

        match op.op_code() {
            OpCode::Insert => {
                self.insert(op)?;
                Ok(None)
            }
            OpCode::Query if op.kind() == OpKind::Command => self.command(op).map(Some),
            OpCode::Query => self.query(op).map(Some),
            OpCode::GetMore => self.get_more(op).map(Some),
            OpCode::KillCursors => {
                for id in op.cursor_ids()? {
                    self.cursors.remove(&id);
                }
                Ok(None)
            }
            OpCode::Command => {
                let request_id = self.next_request_id();
                build::command_reply(request_id, response_to, &doc! { "ok": 1.0 }).map(Some)
            }
            OpCode::Msg => {
                let request_id = self.next_request_id();
                build::msg(request_id, response_to, &doc! { "ok": 1.0 }).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// `numberToReturn` as a batch size and whether the cursor closes after it
fn batch_limit(limit: i32) -> (usize, bool) {
    match limit {
        0 => (DEFAULT_BATCH, false),
        1 => (1, true),
        n if n < 0 => (usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX), true),
        n => (usize::try_from(n).unwrap_or(usize::MAX), false),
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

/// Shared handle to an in-memory server
#[derive(Clone)]
pub struct StubServer {
    state: Arc<Mutex<StubState>>,
}

impl StubServer {
    /// Create an empty server
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StubState {
                collections: HashMap::new(),
                cursors: HashMap::new(),
                next_cursor: CURSOR_ID_BASE,
                next_request_id: 0,
                received: Vec::new(),
                connections: 0,
                refuse_connections: false,
                silent: false,
                user: None,
                authentications: 0,
            })),
        }
    }

    /// Connector whose connections are served by this server
    #[must_use]
    pub fn connector(&self) -> StubConnector {
        StubConnector {
            server: self.clone(),
        }
    }

    /// Every frame received so far, in arrival order
    #[must_use]
    pub fn received(&self) -> Vec<RawOp> {
        self.state.lock().received.clone()
    }

    /// Received frames with the given opcode
    #[must_use]
    pub fn received_of(&self, op_code: OpCode) -> Vec<RawOp> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|op| op.op_code() == op_code)
            .cloned()
            .collect()
    }

    /// Documents stored in `ns`
    #[must_use]
    pub fn documents(&self, ns: &str) -> Vec<Document> {
        self.state
            .lock()
            .collections
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of cursors still open on the server
    #[must_use]
    pub fn open_cursors(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state.lock().cursors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Refuse every new connection
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Keep reading requests but never answer them
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Demand SCRAM-SHA-256 authentication as `username` on every new
    /// connection before serving it
    pub fn require_auth(&self, username: &str, password: &str) {
        self.state.lock().user = Some(StubUser {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    /// Connections that completed authentication
    #[must_use]
    pub fn authentications(&self) -> usize {
        self.state.lock().authentications
    }

    /// Apply one request and produce its reply, if the opcode has one
    ///
    /// # Errors
    ///
    /// Returns error if the request frame is malformed
    pub fn handle(&self, op: &RawOp) -> Result<Option<RawOp>> {
        self.state.lock().handle(op)
    }

    async fn answer(
        &self,
        conn: &mut WireConnection<DuplexStream>,
        request: &RawOp,
        body: &Document,
    ) -> Result<()> {
        let request_id = self.state.lock().next_request_id();
        let reply = build::reply(
            request_id,
            request.header().request_id,
            0,
            0,
            0,
            std::slice::from_ref(body),
        )?;
        conn.send(&reply).await?;
        Ok(())
    }

    /// Server side of the SASL conversation opened by `start`; returns whether
    /// the client proved its password
    async fn converse(
        &self,
        conn: &mut WireConnection<DuplexStream>,
        start: &RawOp,
    ) -> Result<bool> {
        let user = self.state.lock().user.clone();
        let Some(user) = user else {
            return Ok(true);
        };

        let client_first = sasl_payload(start)?;
        let server = ScramServer::new(user);
        let server_first = match server.handle_client_first(&client_first) {
            Ok(server_first) => server_first,
            Err(e) => {
                debug!("Stub rejected client-first message: {e}");
                self.answer(conn, start, &auth_failed()).await?;
                return Ok(false);
            }
        };
        let (client_final, message) = server_first.server_first();
        self.answer(conn, start, &sasl_step(false, message)).await?;

        let proof = conn.recv().await?;
        if !is_command(&proof, "saslContinue") {
            self.answer(conn, &proof, &auth_failed()).await?;
            return Ok(false);
        }

        let outcome = client_final
            .handle_client_final(&sasl_payload(&proof)?)
            .map(|server_final| server_final.server_final());
        match outcome {
            Ok((AuthenticationStatus::Authenticated, message)) => {
                self.answer(conn, &proof, &sasl_step(true, message)).await?;
                self.state.lock().authentications += 1;
                Ok(true)
            }
            Ok(_) => {
                debug!("Stub rejected client proof");
                self.answer(conn, &proof, &auth_failed()).await?;
                Ok(false)
            }
            Err(e) => {
                debug!("Stub rejected client-final message: {e}");
                self.answer(conn, &proof, &auth_failed()).await?;
                Ok(false)
            }
        }
    }

    async fn serve(self, stream: DuplexStream) {
        let mut conn = WireConnection::new(stream);
        let mut authenticated = self.state.lock().user.is_none();

        loop {
            let op = match conn.recv().await {
                Ok(op) => op,
                Err(e) => {
                    trace!("Stub connection closed: {e}");
                    break;
                }
            };

            if !authenticated && is_command(&op, "saslStart") {
                match self.converse(&mut conn, &op).await {
                    Ok(done) => authenticated = done,
                    Err(e) => {
                        debug!("Stub authentication broke off: {e}");
                        break;
                    }
                }
                continue;
            }

            let handled = if authenticated {
                self.handle(&op)
            } else {
                self.state.lock().unauthorized(&op)
            };
            let reply = match handled {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Stub could not handle {:?}: {e}", op.op_code());
                    None
                }
            };

            if self.state.lock().silent {
                continue;
            }

            if let Some(reply) = reply {
                if let Err(e) = conn.send(&reply).await {
                    debug!("Stub failed to answer: {e}");
                    break;
                }
            }
        }
    }
}

impl Default for StubServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens in-memory connections to a [`StubServer`]
#[derive(Clone)]
pub struct StubConnector {
    server: StubServer,
}

#[async_trait]
impl Connector for StubConnector {
    type Stream = DuplexStream;

    async fn connect(&self, addr: &str) -> io::Result<Self::Stream> {
        {
            let mut state = self.server.state.lock();
            if state.refuse_connections {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("stub refused connection to {addr}"),
                ));
            }
            state.connections += 1;
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(self.server.clone().serve(server));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> StubServer {
        let server = StubServer::new();
        let docs: Vec<Document> = (0..20).map(|i| doc! { "n": i, "all": true }).collect();
        let insert = build::insert(1, "db.people", &docs).unwrap();
        assert!(server.handle(&insert).unwrap().is_none());
        server
    }

    #[test]
    fn test_insert_then_query_all() {
        let server = people();
        let query = build::query(2, "db.people", 0, 0, &doc! { "all": true }).unwrap();
        let reply = server.handle(&query).unwrap().unwrap();

        let summary = reply.reply_summary().unwrap();
        assert_eq!(summary.number_returned, 20);
        assert_eq!(summary.cursor_id, 0);
        assert_eq!(reply.header().response_to, 2);
    }

    #[test]
    fn test_query_limit_keeps_cursor_open() {
        let server = people();
        let query = build::query(2, "db.people", 0, 5, &doc! {}).unwrap();
        let first = server.handle(&query).unwrap().unwrap().reply_summary().unwrap();
        assert_eq!(first.number_returned, 5);
        assert_ne!(first.cursor_id, 0);
        assert_eq!(server.open_cursors(), vec![first.cursor_id]);

        let more = build::get_more(3, "db.people", 10, first.cursor_id).unwrap();
        let second = server.handle(&more).unwrap().unwrap().reply_summary().unwrap();
        assert_eq!(second.number_returned, 10);
        assert_eq!(second.cursor_id, first.cursor_id);

        let rest = build::get_more(4, "db.people", 10, first.cursor_id).unwrap();
        let last = server.handle(&rest).unwrap().unwrap().reply_summary().unwrap();
        assert_eq!(last.number_returned, 5);
        assert_eq!(last.cursor_id, 0);
        assert!(server.open_cursors().is_empty());
    }

    #[test]
    fn test_negative_limit_closes_cursor() {
        let server = people();
        let query = build::query(2, "db.people", 0, -3, &doc! {}).unwrap();
        let summary = server.handle(&query).unwrap().unwrap().reply_summary().unwrap();
        assert_eq!(summary.number_returned, 3);
        assert_eq!(summary.cursor_id, 0);
    }

    #[test]
    fn test_unknown_cursor_flags_reply() {
        let server = people();
        let more = build::get_more(3, "db.people", 5, 42).unwrap();
        let summary = server.handle(&more).unwrap().unwrap().reply_summary().unwrap();
        assert!(summary.failed);
    }

    #[test]
    fn test_kill_cursors_and_commands() {
        let server = people();
        let query = build::query(2, "db.people", 0, 2, &doc! {}).unwrap();
        let cursor = server.handle(&query).unwrap().unwrap().reply_summary().unwrap().cursor_id;

        let kill = build::kill_cursors(3, &[cursor]).unwrap();
        assert!(server.handle(&kill).unwrap().is_none());
        assert!(server.open_cursors().is_empty());

        let gle = build::query(4, "admin.$cmd", 0, -1, &doc! { "getLastError": 1 }).unwrap();
        let answer = server.handle(&gle).unwrap().unwrap().reply_summary().unwrap();
        assert_eq!(answer.number_returned, 1);
        assert!(!answer.failed);

        assert_eq!(server.received_of(OpCode::Query).len(), 2);
    }

    #[tokio::test]
    async fn test_connector_serves_requests() {
        let server = people();
        let mut conn = WireConnection::new(server.connector().connect("stub").await.unwrap());

        conn.send(&build::query(9, "db.people", 0, -1, &doc! { "n": 4 }).unwrap())
            .await
            .unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.header().response_to, 9);
        assert_eq!(reply.reply_summary().unwrap().number_returned, 1);
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_requests_are_refused() {
        let server = people();
        server.require_auth("authorizedUser", "authorizedPwd");
        let mut conn = WireConnection::new(server.connector().connect("stub").await.unwrap());

        conn.send(&build::insert(8, "db.people", &[doc! { "n": 99 }]).unwrap())
            .await
            .unwrap();
        conn.send(&build::query(9, "db.people", 0, -1, &doc! {}).unwrap())
            .await
            .unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.header().response_to, 9);
        assert!(reply.reply_summary().unwrap().failed);
        assert_eq!(server.documents("db.people").len(), 20);
        assert_eq!(server.authentications(), 0);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let server = StubServer::new();
        server.refuse_connections(true);
        let err = server.connector().connect("stub").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
