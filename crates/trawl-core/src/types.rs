//! Core identifier and rule-definition types.
//!
//! Rules arrive fully structured (parsing rule text is a host concern).
//! A rule's left-hand side is a list of [`ConditionElement`]s written
//! against named variables; `network_builder` resolves the variables into
//! join tests and hash expressions at install time.

use serde::{Deserialize, Serialize};
use trawl_types::Value;

/// Unique identifier for rules.
pub type RuleId = u64;

/// Dense identifier of a working-memory entity (fact or instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

/// Index of a partial match in the match arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartialMatchId(pub u32);

/// Index of an alpha match record in the match arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaMatchId(pub u32);

/// Index of a join node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinId(pub u32);

/// Index of a pattern-node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderId(pub u32);

/// Index of an alpha-memory hash bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaBucketId(pub u32);

/// Index of an object pattern node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjNodeId(pub u32);

/// Index of an object alpha (terminal) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjAlphaId(pub u32);

/// Stable slot identifier. Slot names intern process-wide so that fact
/// templates and object classes agree on ids.
pub type SlotId = u32;

/// Identifier of a fact template.
pub type TemplateId = u32;

/// Identifier of an object class.
pub type ClassId = u32;

/// Which side of a join a link or memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Lhs,
    Rhs,
}

/// Drive operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOp {
    Assert,
    Retract,
}

/// A production rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    /// Conflict-resolution salience; higher fires first.
    #[serde(default)]
    pub salience: i32,
    pub conditions: Vec<ConditionElement>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
}

/// One element of a rule's left-hand side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConditionElement {
    /// A positive pattern CE.
    Pattern(PatternCondition),
    /// A negated pattern CE.
    Not(PatternCondition),
    /// An exists pattern CE.
    Exists(PatternCondition),
    /// A negated conjunction; compiled as a join from the right. The inner
    /// patterns bind variables local to the group.
    NotAll(Vec<PatternCondition>),
    /// An existential conjunction; compiled as a join from the right.
    ExistsAll(Vec<PatternCondition>),
    /// A test CE over previously bound variables.
    Test(RuleExpr),
    /// A logical group: entities asserted by the rule's actions receive
    /// logical support from the partial match over this prefix. Only
    /// valid as the first element.
    Logical(Vec<ConditionElement>),
}

/// A single pattern: a target plus slot constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCondition {
    pub target: PatternTarget,
    #[serde(default)]
    pub constraints: Vec<SlotConstraint>,
}

/// What kind of working-memory entity a pattern matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PatternTarget {
    /// A fact with the given template name.
    Fact { template: String },
    /// An instance of any of the given classes.
    Object { classes: Vec<String> },
}

/// Constraint on one slot of a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConstraint {
    pub slot: String,
    pub test: SlotTest,
}

/// The constraint forms a slot can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SlotTest {
    /// The slot must equal a constant.
    Eq(Value),
    /// Bind the slot to a single-field variable; later occurrences of the
    /// same variable become equality join tests.
    Bind(String),
    /// Bind a multifield segment of the slot to a `$`-variable.
    BindSegment(String),
    /// A predicate over the slot value (referenced as `SelfValue`) and any
    /// previously bound variables.
    Predicate(RuleExpr),
}

/// Surface expression written against variable names. Resolved to a
/// network-level test expression at rule install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleExpr {
    Const(Value),
    /// A named single-field or segment variable.
    Var(String),
    /// The slot value under test, inside a slot predicate.
    SelfValue,
    Cmp { op: CompareOp, left: Box<RuleExpr>, right: Box<RuleExpr> },
    And(Vec<RuleExpr>),
    Or(Vec<RuleExpr>),
    Not(Box<RuleExpr>),
    /// A registered function call by name.
    Call { function: String, args: Vec<RuleExpr> },
}

/// Comparison operators usable in slot predicates and test CEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Right-hand-side action of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleAction {
    /// Assert a fact built from expressions over the bound variables.
    Assert { template: String, slots: Vec<(String, RuleExpr)> },
    /// Retract the entity matched by the given pattern index.
    Retract { pattern: usize },
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub rule_count: usize,
    pub fact_count: usize,
    pub instance_count: usize,
    pub join_count: usize,
    pub header_count: usize,
    pub partial_match_count: usize,
    pub activation_count: usize,
    pub fires: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Engine Statistics ===")?;
        writeln!(f, "Rules: {}", self.rule_count)?;
        writeln!(f, "Facts: {}", self.fact_count)?;
        writeln!(f, "Instances: {}", self.instance_count)?;
        writeln!(f, "Joins: {}", self.join_count)?;
        writeln!(f, "Pattern headers: {}", self.header_count)?;
        writeln!(f, "Partial matches: {}", self.partial_match_count)?;
        writeln!(f, "Activations: {}", self.activation_count)?;
        writeln!(f, "Rules fired: {}", self.fires)
    }
}

/// Convenience constructors used by hosts and tests.
impl PatternCondition {
    pub fn fact(template: &str) -> Self {
        Self { target: PatternTarget::Fact { template: template.to_string() }, constraints: vec![] }
    }

    pub fn object(class: &str) -> Self {
        Self {
            target: PatternTarget::Object { classes: vec![class.to_string()] },
            constraints: vec![],
        }
    }

    pub fn with_slot(mut self, slot: &str, test: SlotTest) -> Self {
        self.constraints.push(SlotConstraint { slot: slot.to_string(), test });
        self
    }
}

impl RuleExpr {
    pub fn var(name: &str) -> Self {
        RuleExpr::Var(name.to_string())
    }

    pub fn cmp(op: CompareOp, left: RuleExpr, right: RuleExpr) -> Self {
        RuleExpr::Cmp { op, left: Box::new(left), right: Box::new(right) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_roundtrips_through_json() {
        let rule = Rule {
            id: 1,
            name: "pair".into(),
            salience: 10,
            conditions: vec![
                ConditionElement::Pattern(
                    PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
                ),
                ConditionElement::Not(
                    PatternCondition::fact("C").with_slot("v", SlotTest::Bind("x".into())),
                ),
            ],
            actions: vec![RuleAction::Assert {
                template: "D".into(),
                slots: vec![("v".into(), RuleExpr::var("x"))],
            }],
        };
        let text = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "pair");
        assert_eq!(back.conditions.len(), 2);
    }

    #[test]
    fn test_builder_helpers() {
        let p = PatternCondition::fact("A")
            .with_slot("v", SlotTest::Eq(Value::Integer(7)))
            .with_slot("w", SlotTest::Bind("x".into()));
        assert_eq!(p.constraints.len(), 2);
    }
}
