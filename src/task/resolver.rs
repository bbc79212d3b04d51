//! Turns a task descriptor into an invocation and runs it.
//!
//! Each worker loop owns one `Resolver`. Its namespace cache, class
//! instances and expression locals are private to that loop.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::{Instance, Namespace, Registry};
use crate::task::expr::{self, Scope, Statement, Value};
use crate::task::{Callable, Operand, SymbolicCall, Target, Task};

/// (module, class, rendered class args)
type InstanceKey = (String, String, String);

pub struct Resolver {
    registry: Arc<Registry>,
    crosses_boundary: bool,
    trace: bool,
    namespaces: HashMap<String, Arc<Namespace>>,
    instances: HashMap<InstanceKey, Arc<dyn Instance>>,
    locals: HashMap<String, Value>,
}

impl Resolver {
    /// `crosses_boundary` seals every result through its wire form.
    pub fn new(registry: Arc<Registry>, crosses_boundary: bool) -> Self {
        Self {
            registry,
            crosses_boundary,
            trace: false,
            namespaces: HashMap::new(),
            instances: HashMap::new(),
            locals: HashMap::new(),
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Resolve and run `task`, returning a value safe to hand back.
    pub async fn execute(&mut self, task: &Task) -> Result<Payload, TaskError> {
        let value = match task {
            Task::Call(callable, args) => {
                self.trace_call(callable.name(), args);
                callable.invoke(args.clone()).await?
            }
            Task::Sequence(items) => self.sequence(items).await?,
            Task::Symbolic(call) => self.symbolic(call).await?,
            Task::Expr(text) => self.expression(text).await?,
            Task::Data(value) => {
                return Err(TaskError::TargetMustBeCallable {
                    target: value.to_string(),
                });
            }
        };
        if self.trace {
            tracing::debug!(task = %task, value = %value, "Task resolved");
        }
        if self.crosses_boundary {
            value.seal()
        } else {
            value.ensure_portable()?;
            Ok(value)
        }
    }

    fn trace_call(&self, name: &str, args: &Args) {
        if self.trace {
            tracing::debug!(target_name = %name, args = ?args, "Executing");
        }
    }

    async fn sequence(&self, items: &[Operand]) -> Result<Payload, TaskError> {
        let (callable, rest) = match items.split_first() {
            Some((Operand::Callable(c), rest)) => (c, rest),
            Some((Operand::Value(v), _)) => {
                return Err(TaskError::TargetMustBeCallable {
                    target: v.to_string(),
                });
            }
            None => {
                return Err(TaskError::TargetMustBeCallable {
                    target: "()".to_string(),
                });
            }
        };
        let args = rest
            .iter()
            .map(|operand| match operand {
                Operand::Value(v) => Ok(v.clone()),
                Operand::Callable(c) => Err(TaskError::arguments(
                    callable.name(),
                    format!("{c} is not a payload argument"),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let args = Args::Positional(args);
        self.trace_call(callable.name(), &args);
        callable.invoke(args).await
    }

    async fn symbolic(&mut self, call: &SymbolicCall) -> Result<Payload, TaskError> {
        let args = call.effective_args();
        let callable = match &call.target {
            Target::Callable(c) => c.clone(),
            Target::Name(name) => self.resolve_name(name, call)?,
        };
        self.trace_call(callable.name(), &args);
        callable.invoke(args).await
    }

    fn resolve_name(&mut self, target: &str, call: &SymbolicCall) -> Result<Callable, TaskError> {
        if let Some(module) = &call.module {
            let ns = self.load_namespace(module)?;
            let member = match &call.class {
                Some(class) => {
                    let instance = self.instance(&ns, class, &call.class_args)?;
                    instance.member(target).ok_or_else(|| TaskError::MethodNotFound {
                        target: format!("{module}.{class}.{target}"),
                    })?
                }
                None => ns.member(target).ok_or_else(|| TaskError::MethodNotFound {
                    target: format!("{module}.{target}"),
                })?,
            };
            return member.into_callable(target);
        }

        if let Some(class) = &call.class {
            if let Some(factory) = self.registry.builtin_class(class) {
                let instance = factory(&call.class_args)?;
                return instance
                    .member(target)
                    .ok_or_else(|| TaskError::MethodNotFound {
                        target: format!("{class}.{target}"),
                    })?
                    .into_callable(target);
            }
        }

        match self.registry.builtin(target) {
            Some(member) => member.into_callable(target),
            None => Err(TaskError::MethodNotFound {
                target: target.to_string(),
            }),
        }
    }

    /// Load `name` from the registry, caching it for this resolver.
    fn load_namespace(&mut self, name: &str) -> Result<Arc<Namespace>, TaskError> {
        if let Some(ns) = self.namespaces.get(name) {
            return Ok(Arc::clone(ns));
        }
        let ns = self
            .registry
            .namespace(name)
            .ok_or_else(|| TaskError::NamespaceNotFound {
                name: name.to_string(),
            })?;
        tracing::debug!(namespace = %name, "Loaded namespace");
        self.namespaces.insert(name.to_string(), Arc::clone(&ns));
        Ok(ns)
    }

    /// Singleton instance of `ns.class` for these construction args.
    fn instance(
        &mut self,
        ns: &Namespace,
        class: &str,
        class_args: &[Payload],
    ) -> Result<Arc<dyn Instance>, TaskError> {
        let key = (
            ns.name().to_string(),
            class.to_string(),
            Payload::List(class_args.to_vec()).to_string(),
        );
        if let Some(instance) = self.instances.get(&key) {
            return Ok(Arc::clone(instance));
        }
        let factory = ns
            .class_factory(class)
            .ok_or_else(|| TaskError::MethodNotFound {
                target: format!("{}.{class}", ns.name()),
            })?;
        let instance = factory(class_args)?;
        self.instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    async fn expression(&mut self, text: &str) -> Result<Payload, TaskError> {
        if self.trace {
            tracing::debug!(expr = %text, "Evaluating");
        }
        match expr::parse_statement(text)? {
            Statement::Import(name) => {
                self.load_namespace(&name)?;
                Ok(Payload::Text(name))
            }
            Statement::Assign(name, rhs) => {
                let value = self.scope().eval(text, &rhs).await?;
                self.locals.insert(name.clone(), value);
                Ok(Payload::Text(name))
            }
            Statement::Eval(expr) => self.scope().eval(text, &expr).await?.into_payload(),
        }
    }

    fn scope(&self) -> Scope<'_> {
        Scope {
            registry: &self.registry,
            namespaces: &self.namespaces,
            locals: &self.locals,
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("crosses_boundary", &self.crosses_boundary)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("instances", &self.instances.len())
            .field("locals", &self.locals.keys().collect::<Vec<_>>())
            .finish()
    }
}
