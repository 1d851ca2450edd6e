//! # Trawl Core - RETE Production Rule Engine
//!
//! Trawl is a forward-chaining production rule engine built around a RETE
//! discrimination network. Working-memory edits (facts and object
//! instances) filter through hashed alpha memories into a join network
//! that maintains partial matches incrementally; completed left-hand
//! sides become agenda activations, and retraction cascades through the
//! recorded lineage so the agenda never sees a stale match.
//!
//! ## Network Architecture
//!
//! ```text
//! Facts ────────► Pattern Headers ─┐
//!                                  ├─► Alpha Memories ─► Join Network ─► Agenda
//! Instances ─► Object Pattern Tree ┘        (hashed)     (beta memories)
//! ```
//!
//! ## Key Components
//!
//! - **Alpha memories** ([`alpha_memory`]): per-pattern hash-indexed
//!   entity matches with occupied-bucket threading
//! - **Beta memories** ([`beta_memory`]): per-join-side resizable open
//!   hashes of partial matches
//! - **Join network** ([`join_network`]): positive, negated, exists, and
//!   join-from-the-right joins with block links and hashed lookups
//! - **Object pattern network** ([`object_network`]): slot-oriented
//!   discrimination tree with multifield markers, selector dispatch, and
//!   a deferred match-action queue
//! - **Logical dependencies** ([`logical_dependency`]): truth maintenance
//!   for entities asserted under `logical` prefixes
//! - **Binary images** ([`binary_image`]): byte-exact save/load of atom
//!   tables and constructs
//!
//! ## Quick Start
//!
//! ```rust
//! use trawl_core::{TrawlEngine, types::*};
//! use trawl_types::Value;
//!
//! let mut engine = TrawlEngine::new();
//! engine.add_rule(Rule {
//!     id: 1,
//!     name: "pair".into(),
//!     salience: 0,
//!     conditions: vec![
//!         ConditionElement::Pattern(
//!             PatternCondition::fact("A").with_slot("v", SlotTest::Bind("x".into())),
//!         ),
//!         ConditionElement::Pattern(
//!             PatternCondition::fact("B").with_slot("v", SlotTest::Bind("x".into())),
//!         ),
//!     ],
//!     actions: vec![],
//! })?;
//!
//! engine.assert_fact("A", vec![("v", Value::Integer(7))])?;
//! engine.assert_fact("B", vec![("v", Value::Integer(7))])?;
//! assert_eq!(engine.agenda_len(), 1);
//! # Ok::<(), trawl_core::TrawlError>(())
//! ```
//!
//! ## Concurrency Model
//!
//! Single-threaded cooperative: all drives run on the calling thread, and
//! deferred work (the object match queue, forced logical retractions, the
//! partial-match garbage flush) completes synchronously at well-defined
//! drain points. There is no background work and no suspension.

pub mod agenda;
pub mod alpha_memory;
pub mod beta_memory;
pub mod binary_image;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod eval;
pub mod join_network;
pub mod logical_dependency;
pub mod network_builder;
pub mod object_network;
pub mod partial_match;
pub mod types;
pub mod watch;
pub mod working_memory;

pub use diagnostics::{JoinActivity, MatchesReport, Verbosity};
pub use engine::{EngineConfig, TrawlEngine};
pub use error::{TrawlError, TrawlResult};
pub use types::{
    ConditionElement, EngineStats, EntityId, PatternCondition, PatternTarget, Rule, RuleAction,
    RuleExpr, RuleId, SlotConstraint, SlotTest,
};
pub use watch::WatchItem;
