//! bertrpc: a BERT-RPC server.
//!
//! Clients send length-prefixed BERT terms of the form
//! `{call | cast, Module, Function, Args}`; the server routes each one to a
//! registered function and answers with `{reply, Result}`, `{noreply}` or
//! a classified `{error, ...}`.
//!
//! ```ignore
//! use bertrpc::{Config, DispatchTable, Server, Term};
//!
//! let mut table = DispatchTable::new();
//! table.register("calc", "add", |args| match args.as_slice() {
//!     [Term::Integer(a), Term::Integer(b)] => Ok(Term::Integer(a + b)),
//!     _ => Err(bertrpc::Fault::bad_args("add expects two integers")),
//! });
//!
//! let server = Server::new(Config::load()?, table);
//! server.run().await?;
//! ```

pub mod builtin;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod server;
pub mod term;

pub use config::Config;
pub use connection::{ErrorKind, Request, RequestKind, Response};
pub use dispatch::{DispatchTable, Expose, Fault, InvokeError, Module, RoutingFailure};
pub use server::Server;
pub use term::Term;
