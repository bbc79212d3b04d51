//! Task descriptors and result entries.
//!
//! A task is one of:
//! - `Call`: an invocable with stored arguments
//! - `Sequence`: first element invocable, the rest positional arguments
//! - `Symbolic`: a mapping naming a target resolved through the registry
//! - `Expr`: expression text (`import ns`, `x = expr`, or `expr`)
//! - `Data`: a plain value; only meaningful to a pool with a default action

pub mod expr;
pub mod resolver;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::TaskError;
use crate::payload::{Args, Payload};

pub use resolver::Resolver;

type SyncFn = dyn Fn(Args) -> Result<Payload, TaskError> + Send + Sync;
type AsyncFn = dyn Fn(Args) -> BoxFuture<'static, Result<Payload, TaskError>> + Send + Sync;

#[derive(Clone)]
enum Body {
    Blocking(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

/// A named invocable value.
///
/// Blocking bodies run on the blocking pool, async bodies on a spawned task;
/// either way a panic is captured as an execution fault.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    body: Body,
}

impl Callable {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            body: Body::Blocking(Arc::new(f)),
        }
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            body: Body::Async(Arc::new(move |args| Box::pin(f(args)))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the body and wait for its outcome.
    pub async fn invoke(&self, args: Args) -> Result<Payload, TaskError> {
        let joined = match &self.body {
            Body::Blocking(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(args)).await
            }
            Body::Async(f) => tokio::spawn(f(args)).await,
        };
        joined.unwrap_or_else(|e| Err(TaskError::fault(panic_message(e))))
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    panic_text(err.into_panic().as_ref())
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Await `fut` on the current unit, turning a panic inside it into an
/// execution fault.
pub(crate) async fn catch_fault<F>(fut: F) -> Outcome
where
    F: Future<Output = Outcome>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(TaskError::fault(panic_text(panic.as_ref()))))
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callable {}>", self.name)
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callable {}>", self.name)
    }
}

/// One element of a sequence call.
#[derive(Debug, Clone)]
pub enum Operand {
    Callable(Callable),
    Value(Payload),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callable(c) => write!(f, "{c}"),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

impl From<Callable> for Operand {
    fn from(c: Callable) -> Self {
        Self::Callable(c)
    }
}

impl From<Payload> for Operand {
    fn from(v: Payload) -> Self {
        Self::Value(v)
    }
}

/// What a symbolic call names.
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Callable(Callable),
}

/// Reserved mapping fields of a symbolic call.
pub const RESERVED_FIELDS: &[&str] = &["target", "module", "class", "class_args", "args"];

/// A mapping-shaped call resolved through the registry.
#[derive(Debug, Clone)]
pub struct SymbolicCall {
    pub target: Target,
    pub module: Option<String>,
    pub class: Option<String>,
    pub class_args: Vec<Payload>,
    /// Explicit arguments; `None` means "use the unreserved fields".
    pub args: Option<Args>,
    /// Unreserved mapping fields.
    pub extra: BTreeMap<String, Payload>,
}

impl SymbolicCall {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_target(Target::Name(target.into()))
    }

    pub fn with_target(target: Target) -> Self {
        Self {
            target,
            module: None,
            class: None,
            class_args: Vec::new(),
            args: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn class(mut self, class: impl Into<String>, class_args: Vec<Payload>) -> Self {
        self.class = Some(class.into());
        self.class_args = class_args;
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = Some(args);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Build from a mapping with the reserved fields.
    ///
    /// `target` must be present and textual; `class_args` may be a list or a
    /// single value; `args` becomes keyword args for a map, positional
    /// otherwise.
    pub fn from_map(mut map: BTreeMap<String, Payload>) -> Result<Self, TaskError> {
        let target = match map.remove("target") {
            Some(Payload::Text(name)) => Target::Name(name),
            Some(other) => {
                return Err(TaskError::NotCallable {
                    target: other.to_string(),
                });
            }
            None => {
                return Err(TaskError::MethodNotFound {
                    target: "<missing target>".to_string(),
                });
            }
        };
        let text_field = |map: &mut BTreeMap<String, Payload>, key: &str| match map.remove(key) {
            Some(Payload::Text(s)) => Ok(Some(s)),
            Some(Payload::None) | None => Ok(None),
            Some(other) => Err(TaskError::arguments(
                key,
                format!("expected text, got {}", other.type_name()),
            )),
        };
        let module = text_field(&mut map, "module")?;
        let class = text_field(&mut map, "class")?;
        let class_args = match map.remove("class_args") {
            Some(Payload::List(items)) => items,
            Some(Payload::None) | None => Vec::new(),
            Some(single) => vec![single],
        };
        let args = map.remove("args").map(Args::from);
        Ok(Self {
            target,
            module,
            class,
            class_args,
            args,
            extra: map,
        })
    }

    /// Arguments to invoke with: explicit `args`, else the unreserved fields.
    pub fn effective_args(&self) -> Args {
        match &self.args {
            Some(args) => args.clone(),
            None => Args::Keyword(self.extra.clone()),
        }
    }
}

impl fmt::Display for SymbolicCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Name(n) => n.clone(),
            Target::Callable(c) => c.name().to_string(),
        };
        write!(f, "{{target: {target}")?;
        if let Some(module) = &self.module {
            write!(f, ", module: {module}")?;
        }
        if let Some(class) = &self.class {
            write!(f, ", class: {class}, class_args: {}", Payload::List(self.class_args.clone()))?;
        }
        match &self.args {
            Some(Args::Positional(v)) => write!(f, ", args: {}", Payload::List(v.clone()))?,
            Some(Args::Keyword(m)) => write!(f, ", args: {}", Payload::Map(m.clone()))?,
            None if !self.extra.is_empty() => {
                write!(f, ", {}", Payload::Map(self.extra.clone()))?
            }
            None => {}
        }
        write!(f, "}}")
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone)]
pub enum Task {
    Call(Callable, Args),
    Sequence(Vec<Operand>),
    Symbolic(SymbolicCall),
    Expr(String),
    Data(Payload),
}

impl Task {
    /// A callable invoked with no arguments.
    pub fn call(callable: Callable) -> Self {
        Self::Call(callable, Args::none())
    }

    pub fn expr(text: impl Into<String>) -> Self {
        Self::Expr(text.into())
    }

    pub fn sequence(items: impl IntoIterator<Item = Operand>) -> Self {
        Self::Sequence(items.into_iter().collect())
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call(..) => "call",
            Self::Sequence(_) => "sequence",
            Self::Symbolic(_) => "symbolic",
            Self::Expr(_) => "expr",
            Self::Data(_) => "data",
        }
    }
}

impl From<SymbolicCall> for Task {
    fn from(call: SymbolicCall) -> Self {
        Self::Symbolic(call)
    }
}

impl From<Callable> for Task {
    fn from(callable: Callable) -> Self {
        Self::call(callable)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(c, args) if args.is_empty() => write!(f, "{c}"),
            Self::Call(c, Args::Positional(v)) => write!(f, "{c}{}", Payload::List(v.clone())),
            Self::Call(c, Args::Keyword(m)) => write!(f, "{c}{}", Payload::Map(m.clone())),
            Self::Sequence(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Symbolic(call) => write!(f, "{call}"),
            Self::Expr(text) => write!(f, "{text}"),
            Self::Data(value) => write!(f, "{value}"),
        }
    }
}

/// What a task produced: a value or its captured error.
pub type Outcome = Result<Payload, TaskError>;

/// A finished task: the original descriptor and its outcome.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    /// Submission key, when the task was submitted through a keyed worker.
    pub key: Option<String>,
    pub outcome: Outcome,
}

impl TaskResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&Payload> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_splits_reserved_fields() {
        let mut map = BTreeMap::new();
        map.insert("target".to_string(), Payload::from("upper"));
        map.insert("class".to_string(), Payload::from("text"));
        map.insert("class_args".to_string(), Payload::from(vec!["abc"]));
        map.insert("level".to_string(), Payload::Int(3));

        let call = SymbolicCall::from_map(map).unwrap();
        assert!(matches!(&call.target, Target::Name(n) if n == "upper"));
        assert_eq!(call.class.as_deref(), Some("text"));
        assert_eq!(call.class_args, vec![Payload::from("abc")]);
        assert!(call.args.is_none());
        assert_eq!(call.effective_args().get(0, "level"), Some(&Payload::Int(3)));
    }

    #[test]
    fn from_map_explicit_args_win() {
        let mut map = BTreeMap::new();
        map.insert("target".to_string(), Payload::from("max"));
        map.insert("args".to_string(), Payload::from(vec![1i64, 5, 2]));
        map.insert("ignored".to_string(), Payload::Bool(true));
        let call = SymbolicCall::from_map(map).unwrap();
        assert!(matches!(call.effective_args(), Args::Positional(v) if v.len() == 3));
    }

    #[test]
    fn from_map_requires_target() {
        let err = SymbolicCall::from_map(BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TaskError::MethodNotFound { .. }));
    }

    #[test]
    fn task_display_is_stable() {
        let task = Task::sequence([
            Operand::Callable(Callable::new("add", |_| Ok(Payload::None))),
            Operand::Value(Payload::Int(1)),
        ]);
        assert_eq!(task.to_string(), "(<callable add>, 1)");
        assert_eq!(Task::expr("1 + 1").to_string(), "1 + 1");
        let call = SymbolicCall::new("upper").class("text", vec!["abc".into()]);
        assert_eq!(
            Task::from(call).to_string(),
            r#"{target: upper, class: text, class_args: ["abc"]}"#
        );
    }

    #[tokio::test]
    async fn blocking_panic_becomes_fault() {
        let callable = Callable::new("explode", |_| panic!("kaboom"));
        let err = callable.invoke(Args::none()).await.unwrap_err();
        assert!(matches!(err, TaskError::ExecutionFault(msg) if msg.contains("kaboom")));
    }

    #[tokio::test]
    async fn inline_panic_becomes_fault() {
        async fn explode() -> Outcome {
            panic!("inline")
        }
        let outcome = catch_fault(explode()).await;
        assert!(matches!(outcome, Err(TaskError::ExecutionFault(msg)) if msg.contains("inline")));
        assert_eq!(catch_fault(async { Ok(Payload::Int(1)) }).await, Ok(Payload::Int(1)));
    }

    #[tokio::test]
    async fn async_body_runs() {
        let callable = Callable::new_async("later", |_| async { Ok(Payload::Int(42)) });
        assert_eq!(callable.invoke(Args::none()).await.unwrap(), Payload::Int(42));
    }
}
