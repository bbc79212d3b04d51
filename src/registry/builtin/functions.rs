//! Built-in free functions.

use std::cmp::Ordering;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::{Member, Registry};
use crate::task::Callable;

use super::{positional, require_int};

/// Upper bound on `range()` output.
const MAX_RANGE_LEN: i64 = 1_000_000;

pub(crate) fn register(registry: &mut Registry) {
    let table: &[(&str, fn(Args) -> Result<Payload, TaskError>)] = &[
        ("len", len),
        ("str", str_),
        ("repr", repr),
        ("int", int),
        ("float", float),
        ("bool", bool_),
        ("abs", abs),
        ("min", min),
        ("max", max),
        ("sum", sum),
        ("sorted", sorted),
        ("range", range),
    ];
    for (name, f) in table {
        let f = *f;
        registry.register_builtin(name, Member::Callable(Callable::new(*name, f)));
    }
}

/// Length of text, list or map.
pub fn length_of(target: &str, value: &Payload) -> Result<usize, TaskError> {
    match value {
        Payload::Text(s) => Ok(s.chars().count()),
        Payload::List(items) => Ok(items.len()),
        Payload::Map(map) => Ok(map.len()),
        other => Err(TaskError::arguments(
            target,
            format!("{} has no length", other.type_name()),
        )),
    }
}

/// Total order used by `min`, `max` and `sorted`.
pub fn compare(a: &Payload, b: &Payload) -> Option<Ordering> {
    match (a, b) {
        (Payload::Text(x), Payload::Text(y)) => Some(x.cmp(y)),
        (Payload::Int(x), Payload::Int(y)) => Some(x.cmp(y)),
        (Payload::List(x), Payload::List(y)) => {
            for (l, r) in x.iter().zip(y) {
                match compare(l, r)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn len(args: Args) -> Result<Payload, TaskError> {
    let values = positional("len", args, 1, 1)?;
    Ok(Payload::from(length_of("len", &values[0])?))
}

fn str_(args: Args) -> Result<Payload, TaskError> {
    let values = positional("str", args, 0, 1)?;
    Ok(match values.into_iter().next() {
        None => Payload::from(""),
        Some(Payload::Text(s)) => Payload::Text(s),
        Some(other) => Payload::Text(other.to_string()),
    })
}

fn repr(args: Args) -> Result<Payload, TaskError> {
    let values = positional("repr", args, 1, 1)?;
    Ok(Payload::Text(values[0].to_string()))
}

fn int(args: Args) -> Result<Payload, TaskError> {
    let values = positional("int", args, 0, 1)?;
    match values.into_iter().next() {
        None => Ok(Payload::Int(0)),
        Some(Payload::Int(i)) => Ok(Payload::Int(i)),
        Some(Payload::Bool(b)) => Ok(Payload::Int(b as i64)),
        Some(Payload::Float(f)) if f.is_finite() => Ok(Payload::Int(f.trunc() as i64)),
        Some(Payload::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Payload::Int)
            .map_err(|e| TaskError::arguments("int", format!("'{s}': {e}"))),
        Some(other) => Err(TaskError::arguments(
            "int",
            format!("cannot convert {}", other.type_name()),
        )),
    }
}

fn float(args: Args) -> Result<Payload, TaskError> {
    let values = positional("float", args, 0, 1)?;
    match values.into_iter().next() {
        None => Ok(Payload::Float(0.0)),
        Some(Payload::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Payload::Float)
            .map_err(|e| TaskError::arguments("float", format!("'{s}': {e}"))),
        Some(other) => other.as_f64().map(Payload::Float).ok_or_else(|| {
            TaskError::arguments("float", format!("cannot convert {}", other.type_name()))
        }),
    }
}

fn bool_(args: Args) -> Result<Payload, TaskError> {
    let values = positional("bool", args, 0, 1)?;
    Ok(Payload::Bool(
        values.first().map(Payload::is_truthy).unwrap_or(false),
    ))
}

fn abs(args: Args) -> Result<Payload, TaskError> {
    let values = positional("abs", args, 1, 1)?;
    match &values[0] {
        Payload::Int(i) => i
            .checked_abs()
            .map(Payload::Int)
            .ok_or_else(|| TaskError::fault("integer overflow in abs")),
        Payload::Float(f) => Ok(Payload::Float(f.abs())),
        other => Err(TaskError::arguments(
            "abs",
            format!("bad operand {}", other.type_name()),
        )),
    }
}

/// Either a single iterable argument or several scalar arguments.
fn candidates(target: &str, args: Args) -> Result<Vec<Payload>, TaskError> {
    let mut values = positional(target, args, 1, usize::MAX)?;
    if values.len() == 1 {
        match values.remove(0) {
            Payload::List(items) => values = items,
            single => values = vec![single],
        }
    }
    if values.is_empty() {
        return Err(TaskError::arguments(target, "empty sequence"));
    }
    Ok(values)
}

fn extreme(target: &str, args: Args, want: Ordering) -> Result<Payload, TaskError> {
    let values = candidates(target, args)?;
    let mut best = values[0].clone();
    for value in &values[1..] {
        let ord = compare(value, &best).ok_or_else(|| {
            TaskError::arguments(
                target,
                format!("cannot compare {} and {}", value.type_name(), best.type_name()),
            )
        })?;
        if ord == want {
            best = value.clone();
        }
    }
    Ok(best)
}

fn min(args: Args) -> Result<Payload, TaskError> {
    extreme("min", args, Ordering::Less)
}

fn max(args: Args) -> Result<Payload, TaskError> {
    extreme("max", args, Ordering::Greater)
}

fn sum(args: Args) -> Result<Payload, TaskError> {
    let values = positional("sum", args, 1, 1)?;
    let items = values[0]
        .as_list()
        .ok_or_else(|| TaskError::arguments("sum", "expected a list"))?;
    let mut total = Payload::Int(0);
    for item in items {
        total = match (&total, item) {
            (Payload::Int(a), Payload::Int(b)) => a
                .checked_add(*b)
                .map(Payload::Int)
                .ok_or_else(|| TaskError::fault("integer overflow in sum"))?,
            (acc, other) => {
                let x = other.as_f64().ok_or_else(|| {
                    TaskError::arguments("sum", format!("cannot add {}", other.type_name()))
                })?;
                Payload::Float(acc.as_f64().unwrap_or_default() + x)
            }
        };
    }
    Ok(total)
}

fn sorted(args: Args) -> Result<Payload, TaskError> {
    let values = positional("sorted", args, 1, 1)?;
    let mut items = match values.into_iter().next() {
        Some(Payload::List(items)) => items,
        Some(Payload::Text(s)) => s.chars().map(|c| Payload::Text(c.to_string())).collect(),
        _ => return Err(TaskError::arguments("sorted", "expected a list or text")),
    };
    let mut failed = false;
    items.sort_by(|a, b| {
        compare(a, b).unwrap_or_else(|| {
            failed = true;
            Ordering::Equal
        })
    });
    if failed {
        return Err(TaskError::arguments("sorted", "items are not comparable"));
    }
    Ok(Payload::List(items))
}

fn range(args: Args) -> Result<Payload, TaskError> {
    let values = positional("range", args, 1, 3)?;
    let ints = values
        .iter()
        .map(|v| require_int("range", v))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked above"),
    };
    if step == 0 {
        return Err(TaskError::arguments("range", "step must not be zero"));
    }
    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    if span / step.saturating_abs() > MAX_RANGE_LEN {
        return Err(TaskError::arguments("range", "range too large"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Payload::Int(i));
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(Payload::List(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(f: fn(Args) -> Result<Payload, TaskError>, args: Vec<Payload>) -> Payload {
        f(Args::Positional(args)).unwrap()
    }

    #[test]
    fn len_counts_chars_and_items() {
        assert_eq!(call(len, vec!["café".into()]), Payload::Int(4));
        assert_eq!(call(len, vec![Payload::from(vec![1i64, 2])]), Payload::Int(2));
        assert!(len(Args::Positional(vec![Payload::Int(3)])).is_err());
    }

    #[test]
    fn min_max_over_list_or_args() {
        assert_eq!(call(max, vec![Payload::from(vec![1i64, 9, 4])]), Payload::Int(9));
        assert_eq!(call(min, vec![Payload::Int(3), Payload::Float(1.5)]), Payload::Float(1.5));
        assert!(max(Args::Positional(vec![Payload::List(vec![])])).is_err());
    }

    #[test]
    fn sum_promotes_to_float() {
        assert_eq!(call(sum, vec![Payload::from(vec![1i64, 2, 3])]), Payload::Int(6));
        assert_eq!(
            call(sum, vec![Payload::List(vec![Payload::Int(1), Payload::Float(0.5)])]),
            Payload::Float(1.5)
        );
    }

    #[test]
    fn range_variants() {
        assert_eq!(call(range, vec![Payload::Int(3)]), Payload::from(vec![0i64, 1, 2]));
        assert_eq!(
            call(range, vec![Payload::Int(5), Payload::Int(0), Payload::Int(-2)]),
            Payload::from(vec![5i64, 3, 1])
        );
        assert!(range(Args::Positional(vec![Payload::Int(1), Payload::Int(2), Payload::Int(0)])).is_err());
    }

    #[test]
    fn conversions() {
        assert_eq!(call(int, vec![" 42 ".into()]), Payload::Int(42));
        assert_eq!(call(int, vec![Payload::Float(3.9)]), Payload::Int(3));
        assert_eq!(call(float, vec!["2.5".into()]), Payload::Float(2.5));
        assert_eq!(call(str_, vec![Payload::Int(7)]), Payload::from("7"));
        assert_eq!(call(bool_, vec!["".into()]), Payload::Bool(false));
        assert!(int(Args::Positional(vec!["x".into()])).is_err());
    }

    #[test]
    fn sorted_mixed_numbers() {
        assert_eq!(
            call(sorted, vec![Payload::List(vec![Payload::Int(3), Payload::Float(1.0), Payload::Int(2)])]),
            Payload::List(vec![Payload::Float(1.0), Payload::Int(2), Payload::Int(3)])
        );
        assert!(sorted(Args::Positional(vec![Payload::List(vec![Payload::Int(1), "a".into()])])).is_err());
    }
}
