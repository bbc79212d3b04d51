//! Well-known built-in types: `text` and `list`.
//!
//! Each instance hands out members as closures over a snapshot of its value,
//! so a member stays valid after the instance itself is dropped.

use std::sync::Arc;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::{Instance, Member, Registry};
use crate::task::Callable;

use super::functions::{compare, length_of};
use super::{positional, require_text};

pub(crate) fn register(registry: &mut Registry) {
    registry.register_builtin_class("text", |args| {
        let value = match args {
            [] => String::new(),
            [Payload::Text(s)] => s.clone(),
            [other] => other.to_string(),
            _ => return Err(TaskError::arguments("text", "expected at most 1 argument")),
        };
        Ok(Arc::new(TextInstance { value }) as Arc<dyn Instance>)
    });
    registry.register_builtin_class("list", |args| {
        let items = match args {
            [Payload::List(items)] => items.clone(),
            [Payload::Text(s)] => s.chars().map(|c| Payload::Text(c.to_string())).collect(),
            items => items.to_vec(),
        };
        Ok(Arc::new(ListInstance { items }) as Arc<dyn Instance>)
    });
}

/// Instance of the built-in `text` type.
#[derive(Debug, Clone)]
pub struct TextInstance {
    value: String,
}

impl TextInstance {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    fn bind<F>(&self, name: &str, f: F) -> Member
    where
        F: Fn(&str, Args) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        let value = self.value.clone();
        Member::Callable(Callable::new(format!("text.{name}"), move |args| {
            f(&value, args)
        }))
    }
}

impl Instance for TextInstance {
    fn type_name(&self) -> &str {
        "text"
    }

    fn member(&self, name: &str) -> Option<Member> {
        let member = match name {
            "upper" => self.bind(name, |s, args| {
                positional("text.upper", args, 0, 0)?;
                Ok(Payload::from(s.to_uppercase()))
            }),
            "lower" => self.bind(name, |s, args| {
                positional("text.lower", args, 0, 0)?;
                Ok(Payload::from(s.to_lowercase()))
            }),
            "strip" => self.bind(name, |s, args| {
                positional("text.strip", args, 0, 0)?;
                Ok(Payload::from(s.trim()))
            }),
            "len" => self.bind(name, |s, args| {
                positional("text.len", args, 0, 0)?;
                Ok(Payload::from(s.chars().count()))
            }),
            "split" => self.bind(name, |s, args| {
                let values = positional("text.split", args, 0, 1)?;
                let parts: Vec<Payload> = match values.first() {
                    Some(sep) => {
                        let sep = require_text("text.split", sep)?;
                        if sep.is_empty() {
                            return Err(TaskError::arguments("text.split", "empty separator"));
                        }
                        s.split(sep).map(Payload::from).collect()
                    }
                    None => s.split_whitespace().map(Payload::from).collect(),
                };
                Ok(Payload::List(parts))
            }),
            "replace" => self.bind(name, |s, args| {
                let values = positional("text.replace", args, 2, 2)?;
                let from = require_text("text.replace", &values[0])?;
                let to = require_text("text.replace", &values[1])?;
                Ok(Payload::from(s.replace(from, to)))
            }),
            "startswith" => self.bind(name, |s, args| {
                let values = positional("text.startswith", args, 1, 1)?;
                Ok(Payload::Bool(
                    s.starts_with(require_text("text.startswith", &values[0])?),
                ))
            }),
            "endswith" => self.bind(name, |s, args| {
                let values = positional("text.endswith", args, 1, 1)?;
                Ok(Payload::Bool(
                    s.ends_with(require_text("text.endswith", &values[0])?),
                ))
            }),
            "find" => self.bind(name, |s, args| {
                let values = positional("text.find", args, 1, 1)?;
                let needle = require_text("text.find", &values[0])?;
                Ok(Payload::Int(match s.find(needle) {
                    Some(byte) => s[..byte].chars().count() as i64,
                    None => -1,
                }))
            }),
            "join" => self.bind(name, |s, args| {
                let values = positional("text.join", args, 1, 1)?;
                let items = values[0]
                    .as_list()
                    .ok_or_else(|| TaskError::arguments("text.join", "expected a list"))?;
                let parts = items
                    .iter()
                    .map(|p| require_text("text.join", p).map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Payload::from(parts.join(s)))
            }),
            "value" => Member::Value(Payload::from(self.value.as_str())),
            _ => return None,
        };
        Some(member)
    }
}

/// Instance of the built-in `list` type. Members never mutate; `append`
/// returns the extended list.
#[derive(Debug, Clone)]
pub struct ListInstance {
    items: Vec<Payload>,
}

impl ListInstance {
    pub fn new(items: Vec<Payload>) -> Self {
        Self { items }
    }

    fn bind<F>(&self, name: &str, f: F) -> Member
    where
        F: Fn(&[Payload], Args) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        let items = self.items.clone();
        Member::Callable(Callable::new(format!("list.{name}"), move |args| {
            f(&items, args)
        }))
    }
}

impl Instance for ListInstance {
    fn type_name(&self) -> &str {
        "list"
    }

    fn member(&self, name: &str) -> Option<Member> {
        let member = match name {
            "len" => self.bind(name, |items, args| {
                positional("list.len", args, 0, 0)?;
                Ok(Payload::from(length_of("list.len", &Payload::List(items.to_vec()))?))
            }),
            "count" => self.bind(name, |items, args| {
                let values = positional("list.count", args, 1, 1)?;
                Ok(Payload::from(items.iter().filter(|i| **i == values[0]).count()))
            }),
            "index" => self.bind(name, |items, args| {
                let values = positional("list.index", args, 1, 1)?;
                items
                    .iter()
                    .position(|i| *i == values[0])
                    .map(Payload::from)
                    .ok_or_else(|| TaskError::fault(format!("{} is not in list", values[0])))
            }),
            "reversed" => self.bind(name, |items, args| {
                positional("list.reversed", args, 0, 0)?;
                Ok(Payload::List(items.iter().rev().cloned().collect()))
            }),
            "sorted" => self.bind(name, |items, args| {
                positional("list.sorted", args, 0, 0)?;
                let mut out = items.to_vec();
                let mut failed = false;
                out.sort_by(|a, b| {
                    compare(a, b).unwrap_or_else(|| {
                        failed = true;
                        std::cmp::Ordering::Equal
                    })
                });
                if failed {
                    return Err(TaskError::arguments("list.sorted", "items are not comparable"));
                }
                Ok(Payload::List(out))
            }),
            "append" => self.bind(name, |items, args| {
                let values = positional("list.append", args, 1, 1)?;
                let mut out = items.to_vec();
                out.extend(values);
                Ok(Payload::List(out))
            }),
            _ => return None,
        };
        Some(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn invoke(instance: &dyn Instance, name: &str, args: Vec<Payload>) -> Payload {
        let member = instance.member(name).unwrap();
        member
            .into_callable(name)
            .unwrap()
            .invoke(Args::Positional(args))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn text_members() {
        let text = TextInstance::new("  Hello World ");
        assert_eq!(invoke(&text, "strip", vec![]).await, Payload::from("Hello World"));
        assert_eq!(
            invoke(&text, "split", vec![]).await,
            Payload::from(vec!["Hello", "World"])
        );
        assert_eq!(invoke(&text, "find", vec!["World".into()]).await, Payload::Int(8));
        assert!(text.member("explode").is_none());
        assert!(matches!(text.member("value"), Some(Member::Value(_))));
    }

    #[tokio::test]
    async fn text_class_constructs_from_args() {
        let mut registry = Registry::empty();
        register(&mut registry);
        let factory = registry.builtin_class("text").unwrap();
        let instance = factory(&[Payload::from("abc")]).unwrap();
        assert_eq!(invoke(instance.as_ref(), "upper", vec![]).await, Payload::from("ABC"));
        assert!(factory(&[Payload::Int(1), Payload::Int(2)]).is_err());
    }

    #[tokio::test]
    async fn list_members_do_not_mutate() {
        let list = ListInstance::new(vec![Payload::Int(3), Payload::Int(1), Payload::Int(3)]);
        assert_eq!(invoke(&list, "count", vec![Payload::Int(3)]).await, Payload::Int(2));
        assert_eq!(
            invoke(&list, "append", vec![Payload::Int(9)]).await,
            Payload::from(vec![3i64, 1, 3, 9])
        );
        assert_eq!(invoke(&list, "len", vec![]).await, Payload::Int(3));
        assert_eq!(
            invoke(&list, "sorted", vec![]).await,
            Payload::from(vec![1i64, 3, 3])
        );
    }
}
