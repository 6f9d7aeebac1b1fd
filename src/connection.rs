//! Per-connection protocol state machine.
//!
//! A connection loops over frames:
//!
//! ```text
//! AwaitingFrame -> Decoding -> Validating -> Dispatching -> Encoding -+
//!       ^                                                            |
//!       +------------------------------------------------------------+
//!       |
//!       +-> Closed   (peer disconnected, or a framing/transport error)
//! ```
//!
//! Nothing a single request does can close the connection: undecodable
//! payloads and bad shapes are answered with an invalid-request error,
//! routing and application failures with a classified error, and casts
//! always with `{noreply}`. Only the framing layer ends a connection.

use crate::dispatch::{DispatchTable, Fault, InvokeError, PANIC_FAULT_CLASS, ROUTING_FAULT_CLASS};
use crate::frame::{write_frame, FrameError, FrameReader};
use crate::term::{self, Term};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next complete frame
    AwaitingFrame,
    /// Turning the payload into a term
    Decoding,
    /// Checking the request shape
    Validating,
    /// Running the requested function
    Dispatching,
    /// Encoding and writing the response
    Encoding,
    /// Connection finished; no further writes
    Closed,
}

/// Request kind: the first element of the request tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Expects `{reply, Result}` or an error
    Call,
    /// Always answered with `{noreply}`
    Cast,
}

impl RequestKind {
    fn as_str(self) -> &'static str {
        match self {
            RequestKind::Call => "call",
            RequestKind::Cast => "cast",
        }
    }
}

/// A `{call | cast, Module, Function, Args}` request.
///
/// Only the tuple shape and the kind are checked here. Module and function
/// names are resolved against the dispatch table, so a non-atom name is a
/// routing failure rather than a malformed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub module: Term,
    pub function: Term,
    pub args: Term,
}

impl Request {
    /// Validate the shape of a decoded term.
    ///
    /// On failure the term is handed back so the caller can describe it.
    pub fn from_term(term: Term) -> Result<Request, Term> {
        let elements = match term {
            Term::Tuple(elements) => elements,
            other => return Err(other),
        };

        match <[Term; 4]>::try_from(elements) {
            Ok([kind, module, function, args]) => {
                let kind = if kind.is_atom("call") {
                    RequestKind::Call
                } else if kind.is_atom("cast") {
                    RequestKind::Cast
                } else {
                    return Err(Term::tuple(vec![kind, module, function, args]));
                };
                Ok(Request {
                    kind,
                    module,
                    function,
                    args,
                })
            }
            Err(elements) => Err(Term::Tuple(elements)),
        }
    }

    /// Rebuild the request term
    pub fn to_term(&self) -> Term {
        Term::tuple(vec![
            Term::atom(self.kind.as_str()),
            self.module.clone(),
            self.function.clone(),
            self.args.clone(),
        ])
    }
}

/// Who is to blame for an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server could not route or understand the request
    Server,
    /// The invoked function failed
    User,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Server => "server",
            ErrorKind::User => "user",
        }
    }
}

/// A response, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `{reply, Result}`
    Reply(Term),
    /// `{noreply}`
    NoReply,
    /// `{error, {server, 0, Message}}`
    Invalid(String),
    /// `{error, {Kind, 0, ClassName, Message, Trace}}`
    Error {
        kind: ErrorKind,
        class: String,
        message: String,
        trace: Vec<String>,
    },
}

impl Response {
    /// Invalid-request response for a term or decode-failure description.
    pub fn invalid_request(description: &str) -> Self {
        Response::Invalid(format!("Invalid request: {description}"))
    }

    /// Classify a failed invocation.
    pub fn from_invoke_error(err: InvokeError) -> Self {
        match err {
            InvokeError::Routing(failure) => Response::Error {
                kind: ErrorKind::Server,
                class: ROUTING_FAULT_CLASS.to_string(),
                message: failure.to_string(),
                trace: Vec::new(),
            },
            InvokeError::Application(fault) => Response::Error {
                kind: ErrorKind::User,
                class: fault.class,
                message: fault.message,
                trace: fault.trace,
            },
        }
    }

    /// Build the wire term
    pub fn to_term(&self) -> Term {
        match self {
            Response::Reply(result) => Term::tuple(vec![Term::atom("reply"), result.clone()]),
            Response::NoReply => Term::tuple(vec![Term::atom("noreply")]),
            Response::Invalid(message) => Term::tuple(vec![
                Term::atom("error"),
                Term::tuple(vec![
                    Term::atom("server"),
                    Term::Integer(0),
                    Term::binary(message.clone().into_bytes()),
                ]),
            ]),
            Response::Error {
                kind,
                class,
                message,
                trace,
            } => Term::tuple(vec![
                Term::atom("error"),
                Term::tuple(vec![
                    Term::atom(kind.as_str()),
                    Term::Integer(0),
                    Term::binary(class.clone().into_bytes()),
                    Term::binary(message.clone().into_bytes()),
                    Term::list(
                        trace
                            .iter()
                            .map(|frame| Term::binary(frame.clone().into_bytes()))
                            .collect(),
                    ),
                ]),
            ]),
        }
    }

    /// Parse a response term (client side).
    pub fn from_term(term: &Term) -> Option<Response> {
        match term.as_tuple()? {
            [tag, result] if tag.is_atom("reply") => Some(Response::Reply(result.clone())),
            [tag] if tag.is_atom("noreply") => Some(Response::NoReply),
            [tag, detail] if tag.is_atom("error") => match detail.as_tuple()? {
                [kind, _, message] if kind.is_atom("server") => {
                    Some(Response::Invalid(text(message)?))
                }
                [kind, _, class, message, trace] => Some(Response::Error {
                    kind: match kind.as_atom()? {
                        "server" => ErrorKind::Server,
                        "user" => ErrorKind::User,
                        _ => return None,
                    },
                    class: text(class)?,
                    message: text(message)?,
                    trace: trace.as_list()?.iter().map(text).collect::<Option<_>>()?,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

fn text(term: &Term) -> Option<String> {
    term.as_binary()
        .map(|data| String::from_utf8_lossy(data).into_owned())
}

/// One client connection: frame reader, writer and the shared table.
pub struct Connection<R, W> {
    reader: FrameReader<R>,
    writer: W,
    table: Arc<DispatchTable>,
    state: ConnState,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a connection in the `AwaitingFrame` state.
    pub fn new(reader: R, writer: W, table: Arc<DispatchTable>, max_frame_size: usize) -> Self {
        Self {
            reader: FrameReader::with_max_frame_size(reader, max_frame_size),
            writer,
            table,
            state: ConnState::AwaitingFrame,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Serve requests until the peer disconnects.
    ///
    /// Returns `Ok(())` on an ordinary disconnect. Framing and transport
    /// errors end this connection and are returned for logging.
    pub async fn run(mut self) -> Result<(), FrameError> {
        loop {
            self.transition(ConnState::AwaitingFrame);
            let payload = match self.reader.read_frame().await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    self.transition(ConnState::Closed);
                    debug!("Connection closed by client");
                    return Ok(());
                }
                Err(e) => {
                    self.transition(ConnState::Closed);
                    return Err(e);
                }
            };

            let response = self.respond(payload).await;

            self.transition(ConnState::Encoding);
            let encoded = term::encode(&response.to_term());
            if let Err(e) = write_frame(&mut self.writer, &encoded).await {
                self.transition(ConnState::Closed);
                return Err(e);
            }
        }
    }

    /// Produce the response for one frame payload.
    async fn respond(&mut self, payload: Bytes) -> Response {
        self.transition(ConnState::Decoding);
        let size = payload.len();
        let term = match term::decode_bytes(payload) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, bytes = size, "-> undecodable request");
                let response = Response::invalid_request(&e.to_string());
                error!(response = %response.to_term(), "<-");
                return response;
            }
        };

        self.transition(ConnState::Validating);
        let request = match Request::from_term(term) {
            Ok(request) => request,
            Err(term) => {
                error!(request = %term, "->");
                let response = Response::invalid_request(&term.to_string());
                error!(response = %response.to_term(), "<-");
                return response;
            }
        };

        info!(request = %request.to_term(), "->");

        self.transition(ConnState::Dispatching);
        let kind = request.kind;
        let outcome = invoke_isolated(Arc::clone(&self.table), request).await;

        match (kind, outcome) {
            (RequestKind::Call, Ok(result)) => {
                let response = Response::Reply(result);
                debug!(response = %response.to_term(), "<-");
                response
            }
            (RequestKind::Call, Err(err)) => {
                let response = Response::from_invoke_error(err);
                error!(response = %response.to_term(), "<-");
                if let Response::Error { trace, .. } = &response {
                    if !trace.is_empty() {
                        error!(trace = %trace.join("\n"), "Fault trace");
                    }
                }
                response
            }
            (RequestKind::Cast, outcome) => {
                if let Err(err) = outcome {
                    debug!(error = %err, "Cast failed");
                }
                Response::NoReply
            }
        }
    }
}

/// Run the requested function on the blocking pool so a slow callable
/// never holds up the async workers serving other connections.
async fn invoke_isolated(table: Arc<DispatchTable>, request: Request) -> Result<Term, InvokeError> {
    let invoke = move || -> Result<Term, InvokeError> {
        let Request {
            module,
            function,
            args,
            ..
        } = request;
        let (m, f) = table
            .resolve(&module, &function)
            .map_err(InvokeError::Routing)?;
        table.invoke(m, f, argument_list(args))
    };

    match tokio::task::spawn_blocking(invoke).await {
        Ok(outcome) => outcome,
        Err(e) => Err(InvokeError::Application(Fault::new(
            PANIC_FAULT_CLASS,
            e.to_string(),
        ))),
    }
}

/// A lone non-list term is passed as the single argument.
fn argument_list(args: Term) -> Vec<Term> {
    match args {
        Term::List(args) => args,
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DEFAULT_MAX_FRAME_SIZE;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    fn calc() -> DispatchTable {
        let mut table = DispatchTable::new();
        table.register("calc", "add", |args| match args.as_slice() {
            [Term::Integer(a), Term::Integer(b)] => Ok(Term::Integer(a + b)),
            _ => Err(Fault::bad_args("add expects two integers")),
        });
        table.register("calc", "fail", |_| {
            Err(Fault::new("RuntimeError", "boom").with_trace(vec!["calc.rs:42".to_string()]))
        });
        table.register("calc", "explode", |_| panic!("exploded"));
        table
    }

    struct TestClient {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send_raw(&mut self, payload: &[u8]) {
            write_frame(&mut self.writer, payload).await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let payload = self.reader.read_frame().await.unwrap().unwrap();
            Response::from_term(&term::decode_bytes(payload).unwrap()).unwrap()
        }

        async fn request(&mut self, request: Term) -> Response {
            self.send_raw(&term::encode(&request)).await;
            self.recv().await
        }
    }

    fn start(table: DispatchTable) -> (TestClient, JoinHandle<Result<(), FrameError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let conn = Connection::new(
            server_read,
            server_write,
            Arc::new(table),
            DEFAULT_MAX_FRAME_SIZE,
        );
        let handle = tokio::spawn(conn.run());

        let (client_read, client_write) = tokio::io::split(client);
        let client = TestClient {
            reader: FrameReader::new(client_read),
            writer: client_write,
        };
        (client, handle)
    }

    fn request(kind: &str, module: &str, function: &str, args: Vec<Term>) -> Term {
        Term::tuple(vec![
            Term::atom(kind),
            Term::atom(module),
            Term::atom(function),
            Term::list(args),
        ])
    }

    fn add_request() -> Term {
        request("call", "calc", "add", vec![Term::Integer(1), Term::Integer(2)])
    }

    #[test]
    fn test_request_from_term() {
        let parsed = Request::from_term(add_request()).unwrap();
        assert_eq!(parsed.kind, RequestKind::Call);
        assert_eq!(parsed.module, Term::atom("calc"));
        assert_eq!(parsed.function, Term::atom("add"));
        assert_eq!(
            parsed.args,
            Term::list(vec![Term::Integer(1), Term::Integer(2)])
        );
        assert_eq!(parsed.to_term(), add_request());
    }

    #[test]
    fn test_request_names_are_not_checked_for_shape() {
        let term = Term::tuple(vec![
            Term::atom("cast"),
            Term::binary(&b"calc"[..]),
            Term::Integer(7),
            Term::Integer(5),
        ]);
        let parsed = Request::from_term(term.clone()).unwrap();
        assert_eq!(parsed.kind, RequestKind::Cast);
        assert_eq!(parsed.to_term(), term);
        assert_eq!(argument_list(parsed.args), vec![Term::Integer(5)]);
    }

    #[test]
    fn test_request_shape_rejections() {
        let bad = [
            Term::atom("call"),
            Term::tuple(vec![Term::atom("call"), Term::atom("m"), Term::atom("f")]),
            request("info", "m", "f", vec![]),
            Term::tuple(vec![
                Term::binary(&b"call"[..]),
                Term::atom("m"),
                Term::atom("f"),
                Term::list(vec![]),
            ]),
            Term::tuple(vec![
                Term::atom("cast"),
                Term::atom("m"),
                Term::atom("f"),
                Term::list(vec![]),
                Term::atom("extra"),
            ]),
        ];
        for term in bad {
            assert_eq!(Request::from_term(term.clone()), Err(term));
        }
    }

    #[test]
    fn test_response_terms() {
        let responses = [
            Response::Reply(Term::Integer(3)),
            Response::NoReply,
            Response::invalid_request("{foo}"),
            Response::Error {
                kind: ErrorKind::User,
                class: "RuntimeError".to_string(),
                message: "boom".to_string(),
                trace: vec!["a.rs:1".to_string(), "b.rs:2".to_string()],
            },
        ];
        for response in responses {
            assert_eq!(Response::from_term(&response.to_term()), Some(response));
        }

        assert_eq!(
            Response::NoReply.to_term().to_string(),
            "{noreply}"
        );
        assert_eq!(
            Response::invalid_request("{foo}").to_term().to_string(),
            "{error, {server, 0, <<\"Invalid request: {foo}\">>}}"
        );
    }

    #[tokio::test]
    async fn test_call_reply() {
        let (mut client, _handle) = start(calc());
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_missing_module() {
        let (mut client, _handle) = start(calc());
        match client.request(request("call", "nomod", "f", vec![])).await {
            Response::Error {
                kind,
                class,
                message,
                trace,
            } => {
                assert_eq!(kind, ErrorKind::Server);
                assert_eq!(class, ROUTING_FAULT_CLASS);
                assert!(message.contains("nomod"));
                assert!(trace.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_function() {
        let (mut client, _handle) = start(calc());
        match client.request(request("call", "calc", "missing", vec![])).await {
            Response::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Server);
                assert!(message.contains("calc"));
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_atom_names_are_routing_failures() {
        let (mut client, _handle) = start(calc());
        let binary_module = Term::tuple(vec![
            Term::atom("call"),
            Term::binary(&b"calc"[..]),
            Term::atom("add"),
            Term::list(vec![]),
        ]);
        assert_eq!(
            client.request(binary_module).await,
            Response::Error {
                kind: ErrorKind::Server,
                class: ROUTING_FAULT_CLASS.to_string(),
                message: "No such module '<<\"calc\">>'".to_string(),
                trace: vec![],
            }
        );

        let integer_function = Term::tuple(vec![
            Term::atom("call"),
            Term::atom("calc"),
            Term::Integer(1),
            Term::list(vec![]),
        ]);
        assert_eq!(
            client.request(integer_function).await,
            Response::Error {
                kind: ErrorKind::Server,
                class: ROUTING_FAULT_CLASS.to_string(),
                message: "No such function 'calc:1'".to_string(),
                trace: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_non_list_args_passed_as_single_argument() {
        let mut table = DispatchTable::new();
        table.register("calc", "count", |args| Ok(Term::Integer(args.len() as i64)));
        let (mut client, _handle) = start(table);
        let req = Term::tuple(vec![
            Term::atom("call"),
            Term::atom("calc"),
            Term::atom("count"),
            Term::Integer(5),
        ]);
        assert_eq!(client.request(req).await, Response::Reply(Term::Integer(1)));
    }

    #[tokio::test]
    async fn test_user_fault() {
        let (mut client, _handle) = start(calc());
        assert_eq!(
            client.request(request("call", "calc", "fail", vec![])).await,
            Response::Error {
                kind: ErrorKind::User,
                class: "RuntimeError".to_string(),
                message: "boom".to_string(),
                trace: vec!["calc.rs:42".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_panic_is_user_fault_and_connection_survives() {
        let (mut client, _handle) = start(calc());
        match client.request(request("call", "calc", "explode", vec![])).await {
            Response::Error {
                kind,
                class,
                message,
                ..
            } => {
                assert_eq!(kind, ErrorKind::User);
                assert_eq!(class, PANIC_FAULT_CLASS);
                assert_eq!(message, "exploded");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_cast_panic_still_answers_noreply() {
        let (mut client, _handle) = start(calc());
        assert_eq!(
            client.request(request("cast", "calc", "explode", vec![])).await,
            Response::NoReply
        );
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_cast_hides_faults() {
        let (mut client, _handle) = start(calc());
        assert_eq!(
            client.request(request("cast", "calc", "fail", vec![])).await,
            Response::NoReply
        );
        assert_eq!(
            client.request(request("cast", "nomod", "f", vec![])).await,
            Response::NoReply
        );
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_cast_runs_function() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let mut table = DispatchTable::new();
        table.register("log", "write", move |args| {
            tx.lock().unwrap().send(args).unwrap();
            Ok(Term::atom("ok"))
        });

        let (mut client, _handle) = start(table);
        let args = vec![Term::binary(&b"line"[..])];
        assert_eq!(
            client.request(request("cast", "log", "write", args.clone())).await,
            Response::NoReply
        );
        assert_eq!(rx.recv().unwrap(), args);
    }

    #[tokio::test]
    async fn test_invalid_shape_keeps_connection() {
        let (mut client, _handle) = start(calc());
        let bad = Term::tuple(vec![Term::atom("foo"), Term::atom("bar")]);
        assert_eq!(
            client.request(bad).await,
            Response::Invalid("Invalid request: {foo, bar}".to_string())
        );
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_keeps_connection() {
        let (mut client, _handle) = start(calc());
        client.send_raw(&[131, 200]).await;
        assert_eq!(
            client.recv().await,
            Response::Invalid("Invalid request: unknown tag 200".to_string())
        );
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let (mut client, _handle) = start(calc());
        let mut batch = Vec::new();
        for n in 0..3 {
            let req = request("call", "calc", "add", vec![Term::Integer(n), Term::Integer(10)]);
            batch.extend_from_slice(&crate::frame::encode_frame(&term::encode(&req)).unwrap());
        }
        client.writer.write_all(&batch).await.unwrap();

        for n in 0..3 {
            assert_eq!(client.recv().await, Response::Reply(Term::Integer(n + 10)));
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_clean() {
        let (mut client, handle) = start(calc());
        assert_eq!(
            client.request(add_request()).await,
            Response::Reply(Term::Integer(3))
        );
        client.writer.shutdown().await.unwrap();
        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let conn = Connection::new(server_read, server_write, Arc::new(calc()), 8);
        assert_eq!(conn.state(), ConnState::AwaitingFrame);
        let handle = tokio::spawn(conn.run());

        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&[0, 0, 1, 0]).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(FrameError::MalformedHeader { length: 256, max: 8 })
        ));
    }
}
