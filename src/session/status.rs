use std::fmt;

/// Outcome of one upload attempt.
///
/// Every network, protocol and server failure is reported here rather than
/// as a Rust error, so the upload loop can branch on the classification
/// without unwinding. Only misuse of the API surfaces as
/// [`RequestError`](crate::request::RequestError).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// The server accepted the events.
    Success,
    /// Nothing was attempted; the reconnect cooldown is still running.
    ConnectionClosed,
    /// No connection could be established.
    ConnectionFailed,
    /// The connection dropped or timed out while the request was in flight.
    RequestFailed,
    /// The server returned an empty body.
    EmptyResponse,
    /// The server's body was not valid JSON.
    ParseResponseFailed,
    /// The server's body carried no `status` field.
    UnknownError,
    /// The server declined the request; carries its status verbatim.
    ServerError(String),
}

impl SendStatus {
    /// Wire-style code for the outcome, matching the server's vocabulary.
    pub fn as_str(&self) -> &str {
        match self {
            SendStatus::Success => "success",
            SendStatus::ConnectionClosed => "connectionClosed",
            SendStatus::ConnectionFailed => "connectionFailed",
            SendStatus::RequestFailed => "requestFailed",
            SendStatus::EmptyResponse => "emptyResponse",
            SendStatus::ParseResponseFailed => "parseResponseFailed",
            SendStatus::UnknownError => "unknownError",
            SendStatus::ServerError(code) => code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SendStatus::Success)
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one [`ClientSession::send`](super::ClientSession::send) attempt did.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub status: SendStatus,
    /// Request body bytes written before the outcome was decided.
    pub bytes_sent: usize,
    /// Raw response body, empty when none was read.
    pub response: String,
}
