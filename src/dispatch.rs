//! Dispatch table mapping `(module, function)` to callables.
//!
//! The table is built once before the server starts and is then shared
//! read-only (behind an `Arc`) by every connection. It has no interior
//! mutability, so nothing can change it once serving begins.
//!
//! Lookups return a tagged outcome and invocations return an explicit
//! two-kind failure, `Routing` or `Application`, so the connection handler
//! classifies errors by matching on a value.

use crate::term::Term;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Class name reported for routing failures
pub const ROUTING_FAULT_CLASS: &str = "ServerError";

/// Class name reported for callables that panic
pub const PANIC_FAULT_CLASS: &str = "panic";

/// A registered function. Receives the request's argument list.
pub type Callable = Arc<dyn Fn(Vec<Term>) -> Result<Term, Fault> + Send + Sync>;

/// Failure raised by a callable.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Error class name reported to the caller
    pub class: String,
    /// Human-readable message
    pub message: String,
    /// Stack-frame or cause descriptions, outermost first; may be empty
    pub trace: Vec<String>,
}

impl Fault {
    /// Create a fault with an empty trace.
    pub fn new<C: Into<String>, M: Into<String>>(class: C, message: M) -> Self {
        Fault {
            class: class.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Attach a trace.
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    /// Build a fault from any error value.
    ///
    /// The class is the error's type name without its module path; the
    /// trace lists the `source()` chain.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let full = std::any::type_name::<E>();
        let class = full.rsplit("::").next().unwrap_or(full);

        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }

        Fault::new(class, error.to_string()).with_trace(trace)
    }

    /// Fault raised for a wrong argument list.
    pub fn bad_args<M: Into<String>>(message: M) -> Self {
        Fault::new("ArgumentError", message)
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callable panicked".to_string()
        };
        Fault::new(PANIC_FAULT_CLASS, message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for Fault {}

/// Why a `(module, function)` pair could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingFailure {
    /// No module of that name is registered
    ModuleMissing { module: String },
    /// The module exists but has no such function
    FunctionMissing { module: String, function: String },
}

impl fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingFailure::ModuleMissing { module } => write!(f, "No such module '{module}'"),
            RoutingFailure::FunctionMissing { module, function } => {
                write!(f, "No such function '{module}:{function}'")
            }
        }
    }
}

impl std::error::Error for RoutingFailure {}

/// Outcome of a failed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// The call never reached a function
    Routing(RoutingFailure),
    /// The function ran and failed
    Application(Fault),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Routing(failure) => write!(f, "{failure}"),
            InvokeError::Application(fault) => write!(f, "{fault}"),
        }
    }
}

impl std::error::Error for InvokeError {}

/// A named group of functions.
pub struct Module {
    name: String,
    funs: HashMap<String, Callable>,
}

impl Module {
    /// Create an empty module.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Module {
            name: name.into(),
            funs: HashMap::new(),
        }
    }

    /// Add a function (builder style). Re-adding a name replaces it.
    pub fn fun<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Term>) -> Result<Term, Fault> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(f));
        self
    }

    /// Add an already-wrapped callable. Re-adding a name replaces it.
    pub fn insert(&mut self, name: &str, callable: Callable) {
        self.funs.insert(name.to_string(), callable);
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a function
    pub fn get(&self, function: &str) -> Option<&Callable> {
        self.funs.get(function)
    }

    /// Registered function names
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.funs.keys().map(|k| k.as_str())
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.funs.len()
    }

    /// True if no functions are registered
    pub fn is_empty(&self) -> bool {
        self.funs.is_empty()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions().collect();
        names.sort_unstable();
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("functions", &names)
            .finish()
    }
}

/// A value whose methods are exposed as one module.
///
/// Every name returned by `exposed` becomes a function that forwards to
/// `call` on a single shared instance.
pub trait Expose: Send + Sync + 'static {
    /// Names of the functions to register
    fn exposed(&self) -> Vec<&'static str>;

    /// Invoke the named function
    fn call(&self, function: &str, args: Vec<Term>) -> Result<Term, Fault>;
}

/// Mapping from module name to module.
#[derive(Default)]
pub struct DispatchTable {
    modules: HashMap<String, Module>,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one function, creating its module on first use.
    ///
    /// Registering an existing `(module, function)` pair overwrites it.
    pub fn register<F>(&mut self, module: &str, function: &str, f: F)
    where
        F: Fn(Vec<Term>) -> Result<Term, Fault> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.to_string())
            .or_insert_with(|| Module::new(module))
            .insert(function, Arc::new(f));
    }

    /// Add a whole module, replacing any module of the same name.
    pub fn add_module(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), module);
    }

    /// Expose every function listed by `context` as module `name`.
    ///
    /// Returns the shared context so the caller can keep a handle to it.
    pub fn expose<T: Expose>(&mut self, name: &str, context: T) -> Arc<T> {
        let context = Arc::new(context);
        let mut module = Module::new(name);
        for function in context.exposed() {
            let ctx = Arc::clone(&context);
            module.insert(function, Arc::new(move |args: Vec<Term>| ctx.call(function, args)));
        }
        self.add_module(module);
        context
    }

    /// Resolve a function.
    pub fn lookup(&self, module: &str, function: &str) -> Result<&Callable, RoutingFailure> {
        let m = self
            .modules
            .get(module)
            .ok_or_else(|| RoutingFailure::ModuleMissing {
                module: module.to_string(),
            })?;

        m.get(function)
            .ok_or_else(|| RoutingFailure::FunctionMissing {
                module: module.to_string(),
                function: function.to_string(),
            })
    }

    /// Turn module and function terms from the wire into names.
    ///
    /// Only atoms name anything. Any other term fails the same way an
    /// unknown name would, module first.
    pub fn resolve<'t>(
        &self,
        module: &'t Term,
        function: &'t Term,
    ) -> Result<(&'t str, &'t str), RoutingFailure> {
        let module_name = module
            .as_atom()
            .ok_or_else(|| RoutingFailure::ModuleMissing {
                module: module.to_string(),
            })?;

        match function.as_atom() {
            Some(function_name) => Ok((module_name, function_name)),
            None if self.modules.contains_key(module_name) => {
                Err(RoutingFailure::FunctionMissing {
                    module: module_name.to_string(),
                    function: function.to_string(),
                })
            }
            None => Err(RoutingFailure::ModuleMissing {
                module: module_name.to_string(),
            }),
        }
    }

    /// Resolve and run a function on the current thread.
    ///
    /// A panic inside the callable is caught and reported as an
    /// application fault.
    pub fn invoke(&self, module: &str, function: &str, args: Vec<Term>) -> Result<Term, InvokeError> {
        let callable = self.lookup(module, function).map_err(InvokeError::Routing)?;

        match panic::catch_unwind(AssertUnwindSafe(|| callable(args))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(fault)) => Err(InvokeError::Application(fault)),
            Err(payload) => Err(InvokeError::Application(Fault::from_panic(payload))),
        }
    }

    /// Get a module by name
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&Module> = self.modules.values().collect();
        modules.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        f.debug_list().entries(modules).finish()
    }
}
