//! Name-based dispatch table for symbolic calls and expressions.
//!
//! Components that own a capability register it here once at startup; the
//! registry is then frozen behind an `Arc` and only read by resolvers.

pub mod builtin;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::task::Callable;

/// Constructor for a class: builds an instance from its construction args.
pub type ClassFactory =
    Arc<dyn Fn(&[Payload]) -> Result<Arc<dyn Instance>, TaskError> + Send + Sync>;

/// An object whose members can be looked up by name.
pub trait Instance: Send + Sync {
    fn type_name(&self) -> &str;

    fn member(&self, name: &str) -> Option<Member>;
}

/// A named entry in a namespace or instance.
#[derive(Debug, Clone)]
pub enum Member {
    Callable(Callable),
    Value(Payload),
}

impl Member {
    /// The invocable behind this member, or `NotCallable`.
    pub fn into_callable(self, target: &str) -> Result<Callable, TaskError> {
        match self {
            Self::Callable(c) => Ok(c),
            Self::Value(_) => Err(TaskError::NotCallable {
                target: target.to_string(),
            }),
        }
    }
}

/// A named collection of functions, constants and classes.
#[derive(Clone)]
pub struct Namespace {
    name: String,
    members: HashMap<String, Member>,
    classes: HashMap<String, ClassFactory>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
            classes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a blocking function member.
    pub fn function<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(Args) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        let qualified = format!("{}.{}", self.name, name);
        self.callable(name, Callable::new(qualified, f))
    }

    pub fn callable(mut self, name: &str, callable: Callable) -> Self {
        self.members
            .insert(name.to_string(), Member::Callable(callable));
        self
    }

    pub fn value(mut self, name: &str, value: impl Into<Payload>) -> Self {
        self.members
            .insert(name.to_string(), Member::Value(value.into()));
        self
    }

    pub fn class<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&[Payload]) -> Result<Arc<dyn Instance>, TaskError> + Send + Sync + 'static,
    {
        self.classes.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.members.get(name).cloned()
    }

    pub fn class_factory(&self, name: &str) -> Option<ClassFactory> {
        self.classes.get(name).cloned()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of built-ins and named namespaces.
pub struct Registry {
    builtins: HashMap<String, Member>,
    builtin_classes: HashMap<String, ClassFactory>,
    namespaces: HashMap<String, Arc<Namespace>>,
    /// Names that a namespace registration may not shadow.
    protected: HashSet<String>,
}

impl Registry {
    /// Create a registry with no built-ins.
    pub fn empty() -> Self {
        Self {
            builtins: HashMap::new(),
            builtin_classes: HashMap::new(),
            namespaces: HashMap::new(),
            protected: HashSet::new(),
        }
    }

    /// Create a registry pre-populated with the well-known built-ins.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register_builtin(&mut self, name: &str, member: Member) {
        self.protected.insert(name.to_string());
        self.builtins.insert(name.to_string(), member);
        tracing::debug!("Registered builtin: {}", name);
    }

    pub fn register_builtin_class<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&[Payload]) -> Result<Arc<dyn Instance>, TaskError> + Send + Sync + 'static,
    {
        self.protected.insert(name.to_string());
        self.builtin_classes
            .insert(name.to_string(), Arc::new(factory));
        tracing::debug!("Registered builtin class: {}", name);
    }

    /// Register a namespace. Rejects namespaces that would shadow a built-in.
    pub fn register_namespace(&mut self, namespace: Namespace) -> bool {
        let name = namespace.name().to_string();
        if self.protected.contains(&name) {
            tracing::warn!(
                namespace = %name,
                "Rejected namespace registration: would shadow a built-in"
            );
            return false;
        }
        self.namespaces.insert(name.clone(), Arc::new(namespace));
        tracing::debug!("Registered namespace: {}", name);
        true
    }

    pub fn builtin(&self, name: &str) -> Option<Member> {
        self.builtins.get(name).cloned()
    }

    pub fn builtin_class(&self, name: &str) -> Option<ClassFactory> {
        self.builtin_classes.get(name).cloned()
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(name).cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    pub fn builtin_count(&self) -> usize {
        self.builtins.len() + self.builtin_classes.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builtins", &self.builtins.len())
            .field("builtin_classes", &self.builtin_classes.len())
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get_namespace() {
        let mut registry = Registry::empty();
        let ns = Namespace::new("device")
            .function("ping", |_| Ok(Payload::from("pong")))
            .value("VERSION", "1.2");
        assert!(registry.register_namespace(ns));
        assert!(registry.has_namespace("device"));

        let ns = registry.namespace("device").unwrap();
        assert!(matches!(ns.member("ping"), Some(Member::Callable(_))));
        assert!(matches!(ns.member("VERSION"), Some(Member::Value(_))));
        assert!(ns.member("missing").is_none());
    }

    #[test]
    fn namespace_cannot_shadow_builtin() {
        let mut registry = Registry::new();
        assert!(registry.builtin("len").is_some());
        assert!(!registry.register_namespace(Namespace::new("len")));
        assert!(!registry.has_namespace("len"));
    }

    #[test]
    fn value_member_is_not_callable() {
        let member = Member::Value(Payload::Int(1));
        assert!(matches!(
            member.into_callable("VERSION"),
            Err(TaskError::NotCallable { target }) if target == "VERSION"
        ));
    }

    #[test]
    fn builtin_classes_present() {
        let registry = Registry::new();
        assert!(registry.builtin_class("text").is_some());
        assert!(registry.builtin_class("list").is_some());
        assert!(registry.builtin_class("socket").is_none());
    }
}
