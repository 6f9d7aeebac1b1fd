//! Built-in `berp` module.
//!
//! Small functions registered by the server binary for health checks and
//! latency measurement, reachable without any application code:
//!
//! ```text
//! {call, berp, ping, []}        -> {reply, pong}
//! {call, berp, echo, [X]}       -> {reply, X}
//! {call, berp, echo, [X, Y]}    -> {reply, [X, Y]}
//! {call, berp, sleep, [Millis]} -> {reply, ok}   (after Millis ms)
//! ```

use crate::dispatch::{Fault, Module};
use crate::term::Term;
use std::time::Duration;

/// Module name
pub const MODULE: &str = "berp";

/// Upper bound for `sleep`, in milliseconds
const MAX_SLEEP_MS: i64 = 60_000;

/// Build the module.
pub fn module() -> Module {
    Module::new(MODULE)
        .fun("ping", ping)
        .fun("echo", echo)
        .fun("sleep", sleep)
}

fn ping(args: Vec<Term>) -> Result<Term, Fault> {
    if !args.is_empty() {
        return Err(Fault::bad_args("ping takes no arguments"));
    }
    Ok(Term::atom("pong"))
}

fn echo(mut args: Vec<Term>) -> Result<Term, Fault> {
    if args.len() == 1 {
        return Ok(args.remove(0));
    }
    Ok(Term::List(args))
}

fn sleep(args: Vec<Term>) -> Result<Term, Fault> {
    let millis = match args.as_slice() {
        [Term::Integer(ms)] if (0..=MAX_SLEEP_MS).contains(ms) => *ms as u64,
        _ => {
            return Err(Fault::bad_args(format!(
                "sleep expects milliseconds between 0 and {MAX_SLEEP_MS}"
            )))
        }
    };
    std::thread::sleep(Duration::from_millis(millis));
    Ok(Term::atom("ok"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchTable, InvokeError};

    fn table() -> DispatchTable {
        let mut table = DispatchTable::new();
        table.add_module(module());
        table
    }

    #[test]
    fn test_ping() {
        assert_eq!(table().invoke(MODULE, "ping", vec![]), Ok(Term::atom("pong")));
        assert!(matches!(
            table().invoke(MODULE, "ping", vec![Term::Integer(1)]),
            Err(InvokeError::Application(_))
        ));
    }

    #[test]
    fn test_echo() {
        let table = table();
        let x = Term::binary(&b"hello"[..]);
        assert_eq!(table.invoke(MODULE, "echo", vec![x.clone()]), Ok(x.clone()));
        assert_eq!(
            table.invoke(MODULE, "echo", vec![x.clone(), Term::Integer(1)]),
            Ok(Term::list(vec![x, Term::Integer(1)]))
        );
    }

    #[test]
    fn test_sleep() {
        assert_eq!(
            table().invoke(MODULE, "sleep", vec![Term::Integer(1)]),
            Ok(Term::atom("ok"))
        );
        match table().invoke(MODULE, "sleep", vec![Term::Integer(-5)]) {
            Err(InvokeError::Application(fault)) => assert_eq!(fault.class, "ArgumentError"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
