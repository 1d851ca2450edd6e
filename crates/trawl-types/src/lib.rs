//! Trawl Types
//!
//! This crate defines the leaf data types shared across the Trawl engine:
//! the [`Value`] sum type carried by working-memory slots and join tests,
//! and the [`AtomTable`] that interns symbols, strings, instance names,
//! integers, floats, and bitmaps. Every interned atom receives a stable
//! `bucket` index; the RETE hash folds in `trawl-core` consume those bucket
//! values directly, so two engines that intern the same atoms in the same
//! order produce identical memory hashes.

mod atoms;
mod value;

pub use atoms::{AtomTable, AtomTableCounts, LexemeKind};
pub use value::{Value, ValueType};
