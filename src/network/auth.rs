//! SCRAM-SHA-256 authentication of a freshly opened connection

use std::fmt;

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use scram::ScramClient;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::wire::build;
use crate::{ReplayError, Result};

use super::WireConnection;

/// The only SASL mechanism spoken
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Request ids of the handshake. Authentication finishes before any replayed
/// request is issued, so they never meet a recorded id in flight.
const FIRST_REQUEST_ID: i32 = i32::MAX - 8;

/// User credentials taken from the target connection string
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Database the user is defined in
    pub source: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

fn auth_error(message: impl Into<String>) -> ReplayError {
    ReplayError::Auth(message.into())
}

fn binary(message: String) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: message.into_bytes(),
    })
}

fn payload(reply: &Document) -> Result<String> {
    let bytes = reply
        .get_binary_generic("payload")
        .map_err(|e| auth_error(format!("Reply has no SASL payload: {e}")))?;
    String::from_utf8(bytes.clone())
        .map_err(|e| auth_error(format!("SASL payload is not UTF-8: {e}")))
}

fn command_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok != 0.0,
        Some(Bson::Int32(ok)) => *ok != 0,
        Some(Bson::Int64(ok)) => *ok != 0,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

/// Issue one command against `source` and wait for its answer
async fn run_command<S>(
    conn: &mut WireConnection<S>,
    request_id: i32,
    source: &str,
    command: &Document,
) -> Result<Document>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build::query(request_id, &format!("{source}.$cmd"), 0, -1, command)?;
    conn.send(&request).await?;

    let reply = loop {
        let reply = conn.recv().await?;
        if reply.header().response_to == request_id {
            break reply;
        }
    };

    let document = reply.reply_document()?;
    if reply.reply_summary()?.failed || !command_ok(&document) {
        let reason = document
            .get_str("errmsg")
            .or_else(|_| document.get_str("$err"))
            .unwrap_or("no reason given");
        return Err(auth_error(reason));
    }
    Ok(document)
}

/// Authenticate `conn` before anything else is sent on it.
///
/// # Errors
///
/// Returns [`ReplayError::Auth`] if the server rejects the credentials or its
/// proof, and I/O or frame errors if the conversation breaks off
pub async fn authenticate<S>(conn: &mut WireConnection<S>, credentials: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let source = credentials.source.as_str();
    let client = ScramClient::new(&credentials.username, &credentials.password, None);
    let (client, client_first) = client.client_first();

    let start = doc! {
        "saslStart": 1,
        "mechanism": SCRAM_SHA_256,
        "payload": binary(client_first),
        "autoAuthorize": 1,
        "options": { "skipEmptyExchange": true },
    };
    let reply = run_command(conn, FIRST_REQUEST_ID, source, &start).await?;
    let conversation = reply
        .get("conversationId")
        .cloned()
        .ok_or_else(|| auth_error("saslStart reply has no conversationId"))?;

    let client = client
        .handle_server_first(&payload(&reply)?)
        .map_err(|e| auth_error(format!("Bad server-first message: {e}")))?;
    let (client, client_final) = client.client_final();

    let proof = doc! {
        "saslContinue": 1,
        "conversationId": conversation.clone(),
        "payload": binary(client_final),
    };
    let reply = run_command(conn, FIRST_REQUEST_ID + 1, source, &proof).await?;
    client
        .handle_server_final(&payload(&reply)?)
        .map_err(|e| auth_error(format!("Server signature rejected: {e}")))?;

    // Servers that ignore skipEmptyExchange expect one more empty round
    if !reply.get_bool("done").unwrap_or(false) {
        let finish = doc! {
            "saslContinue": 1,
            "conversationId": conversation,
            "payload": binary(String::new()),
        };
        let reply = run_command(conn, FIRST_REQUEST_ID + 2, source, &finish).await?;
        if !reply.get_bool("done").unwrap_or(false) {
            return Err(auth_error("SASL conversation did not complete"));
        }
    }

    debug!("Authenticated as {} on {source}", credentials.username);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Connector;
    use crate::stub::StubServer;

    fn credentials(password: &str) -> Credentials {
        Credentials {
            username: "authorizedUser".to_string(),
            password: password.to_string(),
            source: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_authenticate_against_stub() {
        let server = StubServer::new();
        server.require_auth("authorizedUser", "authorizedPwd");

        let stream = server.connector().connect("stub").await.unwrap();
        let mut conn = WireConnection::new(stream);
        authenticate(&mut conn, &credentials("authorizedPwd"))
            .await
            .unwrap();
        assert_eq!(server.authentications(), 1);

        conn.send(&build::query(1, "db.c", 0, -1, &doc! {}).unwrap())
            .await
            .unwrap();
        let reply = conn.recv().await.unwrap();
        assert!(!reply.reply_summary().unwrap().failed);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let server = StubServer::new();
        server.require_auth("authorizedUser", "authorizedPwd");

        let stream = server.connector().connect("stub").await.unwrap();
        let mut conn = WireConnection::new(stream);
        let err = authenticate(&mut conn, &credentials("guess"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Auth(_)), "{err}");
        assert_eq!(server.authentications(), 0);
    }

    #[test]
    fn test_debug_hides_password() {
        let shown = format!("{:?}", credentials("authorizedPwd"));
        assert!(shown.contains("authorizedUser"));
        assert!(!shown.contains("authorizedPwd"));
    }
}
