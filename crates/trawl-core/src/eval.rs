//! Network test expressions and their evaluator.
//!
//! [`TestExpr`] is the resolved, network-level form of a rule's surface
//! expressions: variable names have become typed references into the left
//! or right partial match of a join. Evaluation is short-circuited for
//! AND/OR trees and reports failures through an explicit [`EvalError`]
//! rather than a global flag; the drive decides per context whether an
//! error aborts (positive join) or coerces to true (negated join).

use ahash::AHashMap;
use trawl_types::{AtomTable, Value};

use crate::partial_match::MatchArena;
use crate::types::{CompareOp, EntityId, PartialMatchId, SlotId};
use crate::working_memory::WorkingMemory;

/// A resolved network test expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TestExpr {
    Constant(Value),
    /// Slot of the entity bound at `pattern` in the left partial match.
    LhsSlot { pattern: u16, slot: SlotId },
    /// Multifield segment recorded by the `marker`-th marker of the alpha
    /// match bound at `pattern`.
    LhsSegment { pattern: u16, marker: u16 },
    /// Slot of the entity in the right partial match (or the entity under
    /// right-hash computation).
    RhsSlot { slot: SlotId },
    /// Multifield segment of the right entity's alpha match.
    RhsSegment { marker: u16 },
    /// The field under the cursor during an object pattern tree walk.
    CurrentField,
    Cmp { op: CompareOp, left: Box<TestExpr>, right: Box<TestExpr> },
    And(Vec<TestExpr>),
    Or(Vec<TestExpr>),
    Not(Box<TestExpr>),
    /// Call of a registered function by interned name.
    Call { function: String, args: Vec<TestExpr> },
}

/// Evaluation failure. Carries only a message; the drive adds the rule and
/// pattern location when it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Everything an expression can read during one evaluation.
pub struct EvalScope<'a> {
    pub arena: &'a MatchArena,
    pub wm: &'a WorkingMemory,
    pub functions: &'a FunctionRegistry,
    pub lhs: Option<PartialMatchId>,
    pub rhs: Option<PartialMatchId>,
    /// Entity substituting for the right partial match while computing a
    /// right-hash before the alpha match exists.
    pub rhs_entity: Option<EntityId>,
    pub current_field: Option<&'a Value>,
}

impl<'a> EvalScope<'a> {
    fn lhs_entity(&self, pattern: u16) -> Result<EntityId, EvalError> {
        let pm = self.lhs.ok_or_else(|| EvalError::new("no left partial match in scope"))?;
        let alpha = self
            .arena
            .partial_match(pm)
            .binds
            .get(pattern as usize)
            .copied()
            .flatten()
            .ok_or_else(|| EvalError::new(format!("pattern {pattern} is not bound")))?;
        Ok(self.arena.alpha_match(alpha).entity)
    }

    fn rhs_alpha(&self) -> Result<Option<crate::types::AlphaMatchId>, EvalError> {
        match self.rhs {
            Some(pm) => Ok(self.arena.partial_match(pm).binds.first().copied().flatten()),
            None => Ok(None),
        }
    }

    fn rhs_entity(&self) -> Result<EntityId, EvalError> {
        if let Some(alpha) = self.rhs_alpha()? {
            return Ok(self.arena.alpha_match(alpha).entity);
        }
        self.rhs_entity.ok_or_else(|| EvalError::new("no right entity in scope"))
    }

    fn slot_value(&self, entity: EntityId, slot: SlotId) -> Result<Value, EvalError> {
        self.wm
            .slot_value(entity, slot)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("entity has no slot {slot}")))
    }

    fn segment(
        &self,
        alpha: crate::types::AlphaMatchId,
        marker: u16,
    ) -> Result<Value, EvalError> {
        let record = self.arena.alpha_match(alpha);
        let m = record
            .markers
            .get(marker as usize)
            .ok_or_else(|| EvalError::new(format!("no multifield marker {marker}")))?;
        let whole = self.slot_value(record.entity, m.slot)?;
        match whole {
            Value::Multifield(fields) => {
                let end = m.start_position + m.range;
                if end > fields.len() {
                    return Err(EvalError::new("multifield marker out of range"));
                }
                Ok(Value::Multifield(fields[m.start_position..end].to_vec()))
            }
            _ => Err(EvalError::new("marker on a single-field slot")),
        }
    }
}

/// Evaluate an expression to a value.
pub fn evaluate(expr: &TestExpr, scope: &EvalScope<'_>) -> Result<Value, EvalError> {
    match expr {
        TestExpr::Constant(v) => Ok(v.clone()),
        TestExpr::LhsSlot { pattern, slot } => {
            let entity = scope.lhs_entity(*pattern)?;
            scope.slot_value(entity, *slot)
        }
        TestExpr::LhsSegment { pattern, marker } => {
            let pm = scope.lhs.ok_or_else(|| EvalError::new("no left partial match in scope"))?;
            let alpha = scope
                .arena
                .partial_match(pm)
                .binds
                .get(*pattern as usize)
                .copied()
                .flatten()
                .ok_or_else(|| EvalError::new(format!("pattern {pattern} is not bound")))?;
            scope.segment(alpha, *marker)
        }
        TestExpr::RhsSlot { slot } => {
            let entity = scope.rhs_entity()?;
            scope.slot_value(entity, *slot)
        }
        TestExpr::RhsSegment { marker } => {
            let alpha = scope
                .rhs_alpha()?
                .ok_or_else(|| EvalError::new("no right alpha match in scope"))?;
            scope.segment(alpha, *marker)
        }
        TestExpr::CurrentField => scope
            .current_field
            .cloned()
            .ok_or_else(|| EvalError::new("no field under the pattern cursor")),
        TestExpr::Cmp { op, left, right } => {
            let lv = evaluate(left, scope)?;
            let rv = evaluate(right, scope)?;
            Ok(Value::Boolean(compare(*op, &lv, &rv)?))
        }
        TestExpr::And(parts) => {
            for part in parts {
                if !evaluate_bool(part, scope)? {
                    return Ok(Value::Boolean(false));
                }
            }
            Ok(Value::Boolean(true))
        }
        TestExpr::Or(parts) => {
            for part in parts {
                if evaluate_bool(part, scope)? {
                    return Ok(Value::Boolean(true));
                }
            }
            Ok(Value::Boolean(false))
        }
        TestExpr::Not(inner) => Ok(Value::Boolean(!evaluate_bool(inner, scope)?)),
        TestExpr::Call { function, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, scope)?);
            }
            scope.functions.call(function, &values)
        }
    }
}

/// Evaluate an expression as a boolean join test. Anything but an explicit
/// false result counts as satisfied.
pub fn evaluate_bool(expr: &TestExpr, scope: &EvalScope<'_>) -> Result<bool, EvalError> {
    Ok(evaluate(expr, scope)?.is_truthy())
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => Ok(left.matches(right)),
        CompareOp::Ne => Ok(!left.matches(right)),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            match left.partial_cmp(right) {
                Some(ordering) => Ok(match op {
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    _ => unreachable!(),
                }),
                None => Err(EvalError::new(format!(
                    "cannot order {} against {}",
                    left.type_name(),
                    right.type_name()
                ))),
            }
        }
    }
}

/// Fold a hash expression list into an unsigned hash with multiplier
/// stride 509. Atom results contribute their interned bucket; evaluation
/// errors and multifields contribute zero, as the original fold did for
/// result types its switch did not name.
pub fn fold_hash_list(
    exprs: &[TestExpr],
    scope: &EvalScope<'_>,
    atoms: &mut AtomTable,
) -> u64 {
    let mut hash: u64 = 0;
    let mut multiplier: u64 = 1;
    for expr in exprs {
        if let Ok(value) = evaluate(expr, scope) {
            hash = hash.wrapping_add(atoms.bucket_of(&value).wrapping_mul(multiplier));
        }
        multiplier = multiplier.wrapping_mul(509);
    }
    hash
}

type BuiltinFn = fn(&[Value]) -> Result<Value, EvalError>;

/// Registry of functions callable from join tests and RHS expressions.
/// Looked up by interned name when restoring a binary image.
pub struct FunctionRegistry {
    functions: AHashMap<String, BuiltinFn>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry").field("count", &self.functions.len()).finish()
    }
}

impl FunctionRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self { functions: AHashMap::new() };
        registry.register("+", builtin_add);
        registry.register("-", builtin_sub);
        registry.register("*", builtin_mul);
        registry.register("/", builtin_div);
        registry.register("abs", builtin_abs);
        registry.register("length$", builtin_length);
        registry.register("str-cat", builtin_str_cat);
        registry
    }

    pub fn register(&mut self, name: &str, function: BuiltinFn) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|s| s.as_str())
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match self.functions.get(name) {
            Some(function) => function(args),
            None => Err(EvalError::new(format!("unknown function '{name}'"))),
        }
    }
}

fn numeric_args(args: &[Value]) -> Result<Vec<f64>, EvalError> {
    args.iter()
        .map(|v| v.as_float().ok_or_else(|| EvalError::new(format!("expected number, got {v}"))))
        .collect()
}

fn all_integers(args: &[Value]) -> bool {
    args.iter().all(|v| matches!(v, Value::Integer(_)))
}

fn builtin_add(args: &[Value]) -> Result<Value, EvalError> {
    if all_integers(args) {
        let mut total = 0i64;
        for v in args {
            total = total.wrapping_add(v.as_integer().unwrap_or(0));
        }
        return Ok(Value::Integer(total));
    }
    Ok(Value::Float(numeric_args(args)?.iter().sum()))
}

fn builtin_sub(args: &[Value]) -> Result<Value, EvalError> {
    let numbers = numeric_args(args)?;
    let (first, rest) = numbers.split_first().ok_or_else(|| EvalError::new("- needs arguments"))?;
    let result = rest.iter().fold(*first, |acc, n| acc - n);
    if all_integers(args) {
        return Ok(Value::Integer(result as i64));
    }
    Ok(Value::Float(result))
}

fn builtin_mul(args: &[Value]) -> Result<Value, EvalError> {
    let numbers = numeric_args(args)?;
    let result = numbers.iter().product::<f64>();
    if all_integers(args) {
        return Ok(Value::Integer(result as i64));
    }
    Ok(Value::Float(result))
}

fn builtin_div(args: &[Value]) -> Result<Value, EvalError> {
    let numbers = numeric_args(args)?;
    let (first, rest) = numbers.split_first().ok_or_else(|| EvalError::new("/ needs arguments"))?;
    let mut result = *first;
    for n in rest {
        if *n == 0.0 {
            return Err(EvalError::new("division by zero"));
        }
        result /= n;
    }
    Ok(Value::Float(result))
}

fn builtin_abs(args: &[Value]) -> Result<Value, EvalError> {
    match args {
        [Value::Integer(i)] => Ok(Value::Integer(i.abs())),
        [Value::Float(f)] => Ok(Value::Float(f.abs())),
        _ => Err(EvalError::new("abs expects one number")),
    }
}

fn builtin_length(args: &[Value]) -> Result<Value, EvalError> {
    match args {
        [value] => Ok(Value::Integer(value.field_count() as i64)),
        _ => Err(EvalError::new("length$ expects one argument")),
    }
}

fn builtin_str_cat(args: &[Value]) -> Result<Value, EvalError> {
    let mut out = String::new();
    for v in args {
        match v {
            Value::Str(s) | Value::Symbol(s) | Value::InstanceName(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(Value::Str(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_arithmetic() {
        let registry = FunctionRegistry::with_builtins();
        assert_eq!(
            registry.call("+", &[Value::Integer(2), Value::Integer(3)]).unwrap(),
            Value::Integer(5)
        );
        assert_eq!(
            registry.call("*", &[Value::Integer(2), Value::Float(3.5)]).unwrap(),
            Value::Float(7.0)
        );
        assert!(registry.call("/", &[Value::Integer(1), Value::Integer(0)]).is_err());
        assert!(registry.call("no-such-fn", &[]).is_err());
    }

    #[test]
    fn test_compare_orders_numbers_and_rejects_mixed() {
        assert!(compare(CompareOp::Gt, &Value::Integer(5), &Value::Float(4.5)).unwrap());
        assert!(compare(CompareOp::Eq, &Value::Symbol("a".into()), &Value::Symbol("a".into()))
            .unwrap());
        assert!(compare(CompareOp::Lt, &Value::Symbol("a".into()), &Value::Integer(1)).is_err());
    }
}
