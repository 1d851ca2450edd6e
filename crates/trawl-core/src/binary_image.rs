//! Binary image save and load.
//!
//! An image is byte-exact and self-describing: a magic prefix and version,
//! a sizing tag encoding the writer's sizeof profile, the function-needed
//! names, the atom tables (whose insertion order defines the dense indices
//! every construct payload references), sized construct sections a loader
//! can skip, and a footer equal to the prefix. Loading is defensive: any
//! mismatch rejects the file and leaves the engine in its pre-load state;
//! construct payloads never index past their declared section length.
//!
//! Working memory is not part of an image. A restored engine rebuilds its
//! pattern headers and joins from the saved constructs with zeroed
//! statistics and empty memories.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info};
use trawl_types::{AtomTable, LexemeKind, Value};

use crate::engine::TrawlEngine;
use crate::error::{TrawlError, TrawlResult};
use crate::types::{
    CompareOp, ConditionElement, PatternCondition, PatternTarget, Rule, RuleAction, RuleExpr,
    SlotConstraint, SlotTest,
};

const IMAGE_PREFIX: &[u8] = &[0x01, 0x02, 0x03, 0x04, b'T', b'R', b'A', b'W', b'L'];
const IMAGE_VERSION: &str = "TRAWL V1";
const SECTION_HEADER_LEN: usize = 16;
const SECTION_CLASSES: &[u8; SECTION_HEADER_LEN] = b"CLASSES\0\0\0\0\0\0\0\0\0";
const SECTION_TEMPLATES: &[u8; SECTION_HEADER_LEN] = b"TEMPLATES\0\0\0\0\0\0\0";
const SECTION_RULES: &[u8; SECTION_HEADER_LEN] = b"RULES\0\0\0\0\0\0\0\0\0\0\0";

/// Sizing tag: two-digit decimal sizeof for pointer, double, int, long,
/// long long, concatenated. A load fails when the tag does not match the
/// target build.
fn sizing_tag() -> String {
    format!(
        "{:02}{:02}{:02}{:02}{:02}",
        std::mem::size_of::<usize>(),
        std::mem::size_of::<f64>(),
        std::mem::size_of::<u32>(),
        std::mem::size_of::<u64>(),
        std::mem::size_of::<u128>(),
    )
}

// ----------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------

#[derive(Default)]
struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }
    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }
}

fn lexeme_index(atoms: &AtomTable, text: &str) -> TrawlResult<u64> {
    atoms
        .lookup_lexeme(LexemeKind::Symbol, text)
        .ok_or_else(|| TrawlError::image(format!("atom '{text}' missing from table")))
}

/// Intern every name and constant a rule set references, so the atom
/// sections cover all construct payload indices.
fn intern_rule_atoms(atoms: &mut AtomTable, rule: &Rule) {
    atoms.intern_lexeme(LexemeKind::Symbol, &rule.name);
    for condition in &rule.conditions {
        intern_condition_atoms(atoms, condition);
    }
    for action in &rule.actions {
        match action {
            RuleAction::Assert { template, slots } => {
                atoms.intern_lexeme(LexemeKind::Symbol, template);
                for (slot, expr) in slots {
                    atoms.intern_lexeme(LexemeKind::Symbol, slot);
                    intern_expr_atoms(atoms, expr);
                }
            }
            RuleAction::Retract { .. } => {}
        }
    }
}

fn intern_condition_atoms(atoms: &mut AtomTable, condition: &ConditionElement) {
    match condition {
        ConditionElement::Pattern(p) | ConditionElement::Not(p) | ConditionElement::Exists(p) => {
            intern_pattern_atoms(atoms, p)
        }
        ConditionElement::NotAll(group) | ConditionElement::ExistsAll(group) => {
            for p in group {
                intern_pattern_atoms(atoms, p);
            }
        }
        ConditionElement::Test(expr) => intern_expr_atoms(atoms, expr),
        ConditionElement::Logical(inner) => {
            for c in inner {
                intern_condition_atoms(atoms, c);
            }
        }
    }
}

fn intern_pattern_atoms(atoms: &mut AtomTable, pattern: &PatternCondition) {
    match &pattern.target {
        PatternTarget::Fact { template } => {
            atoms.intern_lexeme(LexemeKind::Symbol, template);
        }
        PatternTarget::Object { classes } => {
            for class in classes {
                atoms.intern_lexeme(LexemeKind::Symbol, class);
            }
        }
    }
    for SlotConstraint { slot, test } in &pattern.constraints {
        atoms.intern_lexeme(LexemeKind::Symbol, slot);
        match test {
            SlotTest::Eq(value) => {
                atoms.bucket_of(value);
            }
            SlotTest::Bind(name) | SlotTest::BindSegment(name) => {
                atoms.intern_lexeme(LexemeKind::Symbol, name);
            }
            SlotTest::Predicate(expr) => intern_expr_atoms(atoms, expr),
        }
    }
}

fn intern_expr_atoms(atoms: &mut AtomTable, expr: &RuleExpr) {
    match expr {
        RuleExpr::Const(value) => {
            atoms.bucket_of(value);
        }
        RuleExpr::Var(name) => {
            atoms.intern_lexeme(LexemeKind::Symbol, name);
        }
        RuleExpr::SelfValue => {}
        RuleExpr::Cmp { left, right, .. } => {
            intern_expr_atoms(atoms, left);
            intern_expr_atoms(atoms, right);
        }
        RuleExpr::And(parts) | RuleExpr::Or(parts) => {
            for part in parts {
                intern_expr_atoms(atoms, part);
            }
        }
        RuleExpr::Not(inner) => intern_expr_atoms(atoms, inner),
        RuleExpr::Call { function, args } => {
            atoms.intern_lexeme(LexemeKind::Symbol, function);
            for arg in args {
                intern_expr_atoms(atoms, arg);
            }
        }
    }
}

fn write_value(w: &mut ImageWriter, atoms: &AtomTable, value: &Value) -> TrawlResult<()> {
    match value {
        Value::Symbol(s) => {
            w.u8(0);
            w.u64(atoms.lookup_lexeme(LexemeKind::Symbol, s).ok_or_else(missing_atom)?);
        }
        Value::Str(s) => {
            w.u8(1);
            w.u64(atoms.lookup_lexeme(LexemeKind::Str, s).ok_or_else(missing_atom)?);
        }
        Value::InstanceName(s) => {
            w.u8(2);
            w.u64(atoms.lookup_lexeme(LexemeKind::InstanceName, s).ok_or_else(missing_atom)?);
        }
        Value::Integer(i) => {
            w.u8(3);
            w.u64(atoms.lookup_integer(*i).ok_or_else(missing_atom)?);
        }
        Value::Float(f) => {
            w.u8(4);
            w.u64(atoms.lookup_float_bits(f.to_bits()).ok_or_else(missing_atom)?);
        }
        Value::Boolean(b) => {
            w.u8(5);
            w.u8(u8::from(*b));
        }
        Value::Multifield(items) => {
            w.u8(6);
            w.u32(items.len() as u32);
            for item in items {
                write_value(w, atoms, item)?;
            }
        }
    }
    Ok(())
}

fn missing_atom() -> TrawlError {
    TrawlError::image("construct references an atom missing from the table")
}

fn write_expr(w: &mut ImageWriter, atoms: &AtomTable, expr: &RuleExpr) -> TrawlResult<()> {
    match expr {
        RuleExpr::Const(value) => {
            w.u8(0);
            write_value(w, atoms, value)?;
        }
        RuleExpr::Var(name) => {
            w.u8(1);
            w.u64(lexeme_index(atoms, name)?);
        }
        RuleExpr::SelfValue => w.u8(2),
        RuleExpr::Cmp { op, left, right } => {
            w.u8(3);
            w.u8(compare_code(*op));
            write_expr(w, atoms, left)?;
            write_expr(w, atoms, right)?;
        }
        RuleExpr::And(parts) => {
            w.u8(4);
            w.u32(parts.len() as u32);
            for part in parts {
                write_expr(w, atoms, part)?;
            }
        }
        RuleExpr::Or(parts) => {
            w.u8(5);
            w.u32(parts.len() as u32);
            for part in parts {
                write_expr(w, atoms, part)?;
            }
        }
        RuleExpr::Not(inner) => {
            w.u8(6);
            write_expr(w, atoms, inner)?;
        }
        RuleExpr::Call { function, args } => {
            w.u8(7);
            w.u64(lexeme_index(atoms, function)?);
            w.u32(args.len() as u32);
            for arg in args {
                write_expr(w, atoms, arg)?;
            }
        }
    }
    Ok(())
}

fn compare_code(op: CompareOp) -> u8 {
    match op {
        CompareOp::Eq => 0,
        CompareOp::Ne => 1,
        CompareOp::Gt => 2,
        CompareOp::Ge => 3,
        CompareOp::Lt => 4,
        CompareOp::Le => 5,
    }
}

fn write_pattern(w: &mut ImageWriter, atoms: &AtomTable, pattern: &PatternCondition) -> TrawlResult<()> {
    match &pattern.target {
        PatternTarget::Fact { template } => {
            w.u8(0);
            w.u64(lexeme_index(atoms, template)?);
        }
        PatternTarget::Object { classes } => {
            w.u8(1);
            w.u32(classes.len() as u32);
            for class in classes {
                w.u64(lexeme_index(atoms, class)?);
            }
        }
    }
    w.u32(pattern.constraints.len() as u32);
    for SlotConstraint { slot, test } in &pattern.constraints {
        w.u64(lexeme_index(atoms, slot)?);
        match test {
            SlotTest::Eq(value) => {
                w.u8(0);
                write_value(w, atoms, value)?;
            }
            SlotTest::Bind(name) => {
                w.u8(1);
                w.u64(lexeme_index(atoms, name)?);
            }
            SlotTest::BindSegment(name) => {
                w.u8(2);
                w.u64(lexeme_index(atoms, name)?);
            }
            SlotTest::Predicate(expr) => {
                w.u8(3);
                write_expr(w, atoms, expr)?;
            }
        }
    }
    Ok(())
}

fn write_condition(
    w: &mut ImageWriter,
    atoms: &AtomTable,
    condition: &ConditionElement,
) -> TrawlResult<()> {
    match condition {
        ConditionElement::Pattern(p) => {
            w.u8(0);
            write_pattern(w, atoms, p)?;
        }
        ConditionElement::Not(p) => {
            w.u8(1);
            write_pattern(w, atoms, p)?;
        }
        ConditionElement::Exists(p) => {
            w.u8(2);
            write_pattern(w, atoms, p)?;
        }
        ConditionElement::NotAll(group) => {
            w.u8(3);
            w.u32(group.len() as u32);
            for p in group {
                write_pattern(w, atoms, p)?;
            }
        }
        ConditionElement::ExistsAll(group) => {
            w.u8(4);
            w.u32(group.len() as u32);
            for p in group {
                write_pattern(w, atoms, p)?;
            }
        }
        ConditionElement::Test(expr) => {
            w.u8(5);
            write_expr(w, atoms, expr)?;
        }
        ConditionElement::Logical(inner) => {
            w.u8(6);
            w.u32(inner.len() as u32);
            for c in inner {
                write_condition(w, atoms, c)?;
            }
        }
    }
    Ok(())
}

/// Serialize the engine's constructs and atom tables to `path`.
pub fn bsave(engine: &mut TrawlEngine, path: &Path) -> TrawlResult<()> {
    if engine.bload_active {
        return Err(TrawlError::illegal_state(
            "cannot save a binary image while a loaded image is active",
        ));
    }

    // Pre-pass: make sure every name the constructs reference is in the
    // atom tables, so payload indices resolve.
    let mut rules: Vec<Rule> =
        engine.rules.values().map(|installed| installed.rule.clone()).collect();
    rules.sort_by_key(|rule| rule.id);
    let classes: Vec<(String, Vec<String>)> = (0..engine.wm.class_count())
        .map(|i| {
            let class = engine.wm.class(i as u32);
            let slots =
                class.slots.iter().map(|s| engine.wm.slot_name(*s).to_string()).collect();
            (class.name.clone(), slots)
        })
        .collect();
    let templates: Vec<(String, Vec<String>)> = engine
        .wm
        .templates()
        .map(|(_, t)| {
            let slots = t.slots.iter().map(|s| engine.wm.slot_name(*s).to_string()).collect();
            (t.name.clone(), slots)
        })
        .collect();
    for rule in &rules {
        intern_rule_atoms(&mut engine.atoms, rule);
    }
    for (name, slots) in classes.iter().chain(templates.iter()) {
        engine.atoms.intern_lexeme(LexemeKind::Symbol, name);
        for slot in slots {
            engine.atoms.intern_lexeme(LexemeKind::Symbol, slot);
        }
    }

    let atoms = &engine.atoms;
    let mut w = ImageWriter::default();

    // Header.
    w.buf.extend_from_slice(IMAGE_PREFIX);
    w.string(IMAGE_VERSION);
    w.string(&sizing_tag());

    // Function-needed section: count, byte size, packed names in a
    // stable order.
    let mut names: Vec<&str> = engine.functions.names().collect();
    names.sort_unstable();
    w.u32(names.len() as u32);
    let total: u64 = names.iter().map(|n| n.len() as u64 + 1).sum();
    w.u64(total);
    for name in names {
        w.buf.extend_from_slice(name.as_bytes());
        w.u8(0);
    }

    // Atom sections, in fixed order; dense indices follow insertion
    // order.
    let counts = atoms.counts();
    w.u64(counts.lexemes as u64);
    for (kind, text) in atoms.lexemes() {
        w.u8(match kind {
            LexemeKind::Symbol => 0,
            LexemeKind::Str => 1,
            LexemeKind::InstanceName => 2,
        });
        w.string(text);
    }
    w.u64(counts.floats as u64);
    for bits in atoms.float_bits() {
        w.u64(bits);
    }
    w.u64(counts.integers as u64);
    for value in atoms.integers() {
        w.i64(value);
    }
    w.u64(counts.bitmaps as u64);
    for bitmap in atoms.bitmaps() {
        w.bytes(bitmap);
    }

    // Construct sections, each preceded by a fixed header and its size.
    let mut section = ImageWriter::default();
    section.u32(templates.len() as u32);
    for (name, slots) in &templates {
        section.u64(lexeme_index(atoms, name)?);
        section.u32(slots.len() as u32);
        for slot in slots {
            section.u64(lexeme_index(atoms, slot)?);
        }
    }
    w.buf.extend_from_slice(SECTION_TEMPLATES);
    w.u64(section.buf.len() as u64);
    w.buf.extend_from_slice(&section.buf);

    let mut section = ImageWriter::default();
    section.u32(classes.len() as u32);
    for (name, slots) in &classes {
        section.u64(lexeme_index(atoms, name)?);
        section.u32(slots.len() as u32);
        for slot in slots {
            section.u64(lexeme_index(atoms, slot)?);
        }
    }
    w.buf.extend_from_slice(SECTION_CLASSES);
    w.u64(section.buf.len() as u64);
    w.buf.extend_from_slice(&section.buf);

    let mut section = ImageWriter::default();
    section.u32(rules.len() as u32);
    for rule in &rules {
        section.u64(rule.id);
        section.u64(lexeme_index(atoms, &rule.name)?);
        section.i32(rule.salience);
        section.u32(rule.conditions.len() as u32);
        for condition in &rule.conditions {
            write_condition(&mut section, atoms, condition)?;
        }
        section.u32(rule.actions.len() as u32);
        for action in &rule.actions {
            match action {
                RuleAction::Assert { template, slots } => {
                    section.u8(0);
                    section.u64(lexeme_index(atoms, template)?);
                    section.u32(slots.len() as u32);
                    for (slot, expr) in slots {
                        section.u64(lexeme_index(atoms, slot)?);
                        write_expr(&mut section, atoms, expr)?;
                    }
                }
                RuleAction::Retract { pattern } => {
                    section.u8(1);
                    section.u32(*pattern as u32);
                }
            }
        }
    }
    w.buf.extend_from_slice(SECTION_RULES);
    w.u64(section.buf.len() as u64);
    w.buf.extend_from_slice(&section.buf);

    // Footer equals the prefix.
    w.buf.extend_from_slice(IMAGE_PREFIX);

    let mut file = File::create(path)
        .map_err(|e| TrawlError::image(format!("cannot create image file: {e}")))?;
    file.write_all(&w.buf)
        .map_err(|e| TrawlError::image(format!("cannot write image file: {e}")))?;
    info!(path = %path.display(), bytes = w.buf.len(), "binary image saved");
    Ok(())
}

// ----------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------

struct ImageReader {
    buf: Vec<u8>,
    pos: usize,
}

impl ImageReader {
    fn take(&mut self, n: usize) -> TrawlResult<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(TrawlError::image("truncated image"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    fn u8(&mut self) -> TrawlResult<u8> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> TrawlResult<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> TrawlResult<i32> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> TrawlResult<u64> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> TrawlResult<i64> {
        Ok(i64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn bytes(&mut self) -> TrawlResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn string(&mut self) -> TrawlResult<String> {
        String::from_utf8(self.bytes()?).map_err(|_| TrawlError::image("bad utf-8 in image"))
    }
}

/// Read a file in halving chunks: an allocation failure retries with a
/// smaller batch before giving up.
fn read_file_batched(path: &Path) -> TrawlResult<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|e| TrawlError::image(format!("cannot open image: {e}")))?;
    let size = file
        .metadata()
        .map(|m| m.len() as usize)
        .map_err(|e| TrawlError::image(format!("cannot stat image: {e}")))?;
    let mut out: Vec<u8> = Vec::new();
    let mut batch = size.max(1).min(1 << 20);
    loop {
        match out.try_reserve(batch) {
            Ok(()) => break,
            Err(_) if batch > 4096 => batch /= 2,
            Err(_) => {
                return Err(TrawlError::Resource {
                    message: "cannot allocate image buffer".into(),
                    requested: Some(batch),
                });
            }
        }
    }
    let mut chunk = vec![0u8; batch];
    loop {
        let n = file
            .read(&mut chunk)
            .map_err(|e| TrawlError::image(format!("cannot read image: {e}")))?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

struct LoadedAtoms {
    lexemes: Vec<(LexemeKind, String)>,
    floats: Vec<u64>,
    integers: Vec<i64>,
}

impl LoadedAtoms {
    fn lexeme(&self, index: u64) -> TrawlResult<&(LexemeKind, String)> {
        self.lexemes
            .get(index as usize)
            .ok_or_else(|| TrawlError::image_section("lexeme index out of range", "atoms"))
    }
    fn symbol(&self, index: u64) -> TrawlResult<String> {
        let (kind, text) = self.lexeme(index)?;
        if *kind != LexemeKind::Symbol {
            return Err(TrawlError::image_section("expected a symbol atom", "atoms"));
        }
        Ok(text.clone())
    }
}

fn read_value(r: &mut ImageReader, atoms: &LoadedAtoms) -> TrawlResult<Value> {
    Ok(match r.u8()? {
        0 => {
            let (_, text) = atoms.lexeme(r.u64()?)?;
            Value::Symbol(text.clone())
        }
        1 => {
            let (_, text) = atoms.lexeme(r.u64()?)?;
            Value::Str(text.clone())
        }
        2 => {
            let (_, text) = atoms.lexeme(r.u64()?)?;
            Value::InstanceName(text.clone())
        }
        3 => {
            let index = r.u64()? as usize;
            Value::Integer(*atoms.integers.get(index).ok_or_else(|| {
                TrawlError::image_section("integer index out of range", "atoms")
            })?)
        }
        4 => {
            let index = r.u64()? as usize;
            Value::Float(f64::from_bits(*atoms.floats.get(index).ok_or_else(|| {
                TrawlError::image_section("float index out of range", "atoms")
            })?))
        }
        5 => Value::Boolean(r.u8()? != 0),
        6 => {
            let count = r.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(r, atoms)?);
            }
            Value::Multifield(items)
        }
        _ => return Err(TrawlError::image_section("unknown value tag", "rules")),
    })
}

fn read_expr(r: &mut ImageReader, atoms: &LoadedAtoms) -> TrawlResult<RuleExpr> {
    Ok(match r.u8()? {
        0 => RuleExpr::Const(read_value(r, atoms)?),
        1 => RuleExpr::Var(atoms.symbol(r.u64()?)?),
        2 => RuleExpr::SelfValue,
        3 => {
            let op = decode_compare(r.u8()?)?;
            let left = read_expr(r, atoms)?;
            let right = read_expr(r, atoms)?;
            RuleExpr::Cmp { op, left: Box::new(left), right: Box::new(right) }
        }
        4 => {
            let count = r.u32()? as usize;
            let mut parts = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                parts.push(read_expr(r, atoms)?);
            }
            RuleExpr::And(parts)
        }
        5 => {
            let count = r.u32()? as usize;
            let mut parts = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                parts.push(read_expr(r, atoms)?);
            }
            RuleExpr::Or(parts)
        }
        6 => RuleExpr::Not(Box::new(read_expr(r, atoms)?)),
        7 => {
            let function = atoms.symbol(r.u64()?)?;
            let count = r.u32()? as usize;
            let mut args = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                args.push(read_expr(r, atoms)?);
            }
            RuleExpr::Call { function, args }
        }
        _ => return Err(TrawlError::image_section("unknown expression tag", "rules")),
    })
}

fn decode_compare(code: u8) -> TrawlResult<CompareOp> {
    Ok(match code {
        0 => CompareOp::Eq,
        1 => CompareOp::Ne,
        2 => CompareOp::Gt,
        3 => CompareOp::Ge,
        4 => CompareOp::Lt,
        5 => CompareOp::Le,
        _ => return Err(TrawlError::image_section("unknown comparison code", "rules")),
    })
}

fn read_pattern(r: &mut ImageReader, atoms: &LoadedAtoms) -> TrawlResult<PatternCondition> {
    let target = match r.u8()? {
        0 => PatternTarget::Fact { template: atoms.symbol(r.u64()?)? },
        1 => {
            let count = r.u32()? as usize;
            let mut classes = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                classes.push(atoms.symbol(r.u64()?)?);
            }
            PatternTarget::Object { classes }
        }
        _ => return Err(TrawlError::image_section("unknown pattern target", "rules")),
    };
    let count = r.u32()? as usize;
    let mut constraints = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let slot = atoms.symbol(r.u64()?)?;
        let test = match r.u8()? {
            0 => SlotTest::Eq(read_value(r, atoms)?),
            1 => SlotTest::Bind(atoms.symbol(r.u64()?)?),
            2 => SlotTest::BindSegment(atoms.symbol(r.u64()?)?),
            3 => SlotTest::Predicate(read_expr(r, atoms)?),
            _ => return Err(TrawlError::image_section("unknown slot test tag", "rules")),
        };
        constraints.push(SlotConstraint { slot, test });
    }
    Ok(PatternCondition { target, constraints })
}

fn read_condition(r: &mut ImageReader, atoms: &LoadedAtoms) -> TrawlResult<ConditionElement> {
    Ok(match r.u8()? {
        0 => ConditionElement::Pattern(read_pattern(r, atoms)?),
        1 => ConditionElement::Not(read_pattern(r, atoms)?),
        2 => ConditionElement::Exists(read_pattern(r, atoms)?),
        3 => {
            let count = r.u32()? as usize;
            let mut group = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                group.push(read_pattern(r, atoms)?);
            }
            ConditionElement::NotAll(group)
        }
        4 => {
            let count = r.u32()? as usize;
            let mut group = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                group.push(read_pattern(r, atoms)?);
            }
            ConditionElement::ExistsAll(group)
        }
        5 => ConditionElement::Test(read_expr(r, atoms)?),
        6 => {
            let count = r.u32()? as usize;
            let mut inner = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                inner.push(read_condition(r, atoms)?);
            }
            ConditionElement::Logical(inner)
        }
        _ => return Err(TrawlError::image_section("unknown condition tag", "rules")),
    })
}

/// Restore an engine from a binary image. The current engine must hold no
/// constructs; on any error it is left untouched.
pub fn bload(engine: &mut TrawlEngine, path: &Path) -> TrawlResult<()> {
    if !engine.rules.is_empty() {
        let holders: Vec<&str> =
            engine.rule_names.values().map(String::as_str).collect();
        return Err(TrawlError::illegal_state(format!(
            "some constructs are still in use: {}",
            holders.join(", ")
        )));
    }

    let buf = read_file_batched(path)?;
    let mut r = ImageReader { buf, pos: 0 };

    // Header checks: prefix, version, sizing tag, footer.
    if r.take(IMAGE_PREFIX.len())? != IMAGE_PREFIX {
        return Err(TrawlError::image_section("bad image prefix", "header"));
    }
    let version = r.string()?;
    if version != IMAGE_VERSION {
        return Err(TrawlError::image_section(
            format!("version mismatch: image is '{version}'"),
            "header",
        ));
    }
    let tag = r.string()?;
    if tag != sizing_tag() {
        return Err(TrawlError::image_section(
            format!("sizing tag mismatch: image '{tag}', target '{}'", sizing_tag()),
            "header",
        ));
    }
    if r.buf.len() < IMAGE_PREFIX.len()
        || &r.buf[r.buf.len() - IMAGE_PREFIX.len()..] != IMAGE_PREFIX
    {
        return Err(TrawlError::image_section("bad image footer", "footer"));
    }

    // Function-needed: every name must resolve in the registry.
    let function_count = r.u32()? as usize;
    let byte_size = r.u64()? as usize;
    let packed = r.take(byte_size)?.to_vec();
    let mut names = Vec::with_capacity(function_count.min(1024));
    let mut start = 0usize;
    for _ in 0..function_count {
        let end = packed[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| start + i)
            .ok_or_else(|| TrawlError::image_section("unterminated function name", "functions"))?;
        let name = std::str::from_utf8(&packed[start..end])
            .map_err(|_| TrawlError::image_section("bad function name", "functions"))?;
        names.push(name.to_string());
        start = end + 1;
    }
    for name in &names {
        if !engine.functions.contains(name) {
            return Err(TrawlError::image_section(
                format!("unresolved function '{name}'"),
                "functions",
            ));
        }
    }

    // Atom sections.
    let lexeme_count = r.u64()? as usize;
    let mut lexemes = Vec::with_capacity(lexeme_count.min(1 << 20));
    for _ in 0..lexeme_count {
        let kind = match r.u8()? {
            0 => LexemeKind::Symbol,
            1 => LexemeKind::Str,
            2 => LexemeKind::InstanceName,
            _ => return Err(TrawlError::image_section("unknown lexeme kind", "atoms")),
        };
        lexemes.push((kind, r.string()?));
    }
    let float_count = r.u64()? as usize;
    let mut floats = Vec::with_capacity(float_count.min(1 << 20));
    for _ in 0..float_count {
        floats.push(r.u64()?);
    }
    let integer_count = r.u64()? as usize;
    let mut integers = Vec::with_capacity(integer_count.min(1 << 20));
    for _ in 0..integer_count {
        integers.push(r.i64()?);
    }
    let bitmap_count = r.u64()? as usize;
    let mut bitmaps = Vec::with_capacity(bitmap_count.min(1 << 20));
    for _ in 0..bitmap_count {
        bitmaps.push(r.bytes()?);
    }
    let atoms = LoadedAtoms { lexemes, floats, integers };

    // Construct sections.
    let mut templates: Vec<(String, Vec<String>)> = Vec::new();
    let mut classes: Vec<(String, Vec<String>)> = Vec::new();
    let mut rules: Vec<Rule> = Vec::new();

    while r.buf.len() - r.pos > IMAGE_PREFIX.len() {
        let header: [u8; SECTION_HEADER_LEN] =
            r.take(SECTION_HEADER_LEN)?.try_into().unwrap();
        let size = r.u64()? as usize;
        let section_end = r.pos + size;
        if section_end > r.buf.len() {
            return Err(TrawlError::image_section("section overruns image", "constructs"));
        }
        if header == *SECTION_TEMPLATES {
            let count = r.u32()? as usize;
            for _ in 0..count {
                let name = atoms.symbol(r.u64()?)?;
                let slot_count = r.u32()? as usize;
                let mut slots = Vec::with_capacity(slot_count.min(256));
                for _ in 0..slot_count {
                    slots.push(atoms.symbol(r.u64()?)?);
                }
                templates.push((name, slots));
            }
        } else if header == *SECTION_CLASSES {
            let count = r.u32()? as usize;
            for _ in 0..count {
                let name = atoms.symbol(r.u64()?)?;
                let slot_count = r.u32()? as usize;
                let mut slots = Vec::with_capacity(slot_count.min(256));
                for _ in 0..slot_count {
                    slots.push(atoms.symbol(r.u64()?)?);
                }
                classes.push((name, slots));
            }
        } else if header == *SECTION_RULES {
            let count = r.u32()? as usize;
            for _ in 0..count {
                let id = r.u64()?;
                let name = atoms.symbol(r.u64()?)?;
                let salience = r.i32()?;
                let condition_count = r.u32()? as usize;
                let mut conditions = Vec::with_capacity(condition_count.min(256));
                for _ in 0..condition_count {
                    conditions.push(read_condition(&mut r, &atoms)?);
                }
                let action_count = r.u32()? as usize;
                let mut actions = Vec::with_capacity(action_count.min(256));
                for _ in 0..action_count {
                    match r.u8()? {
                        0 => {
                            let template = atoms.symbol(r.u64()?)?;
                            let slot_count = r.u32()? as usize;
                            let mut slots = Vec::with_capacity(slot_count.min(256));
                            for _ in 0..slot_count {
                                let slot = atoms.symbol(r.u64()?)?;
                                slots.push((slot, read_expr(&mut r, &atoms)?));
                            }
                            actions.push(RuleAction::Assert { template, slots });
                        }
                        1 => {
                            actions.push(RuleAction::Retract { pattern: r.u32()? as usize });
                        }
                        _ => {
                            return Err(TrawlError::image_section("unknown action tag", "rules"));
                        }
                    }
                }
                rules.push(Rule { id, name, salience, conditions, actions });
            }
        } else {
            // Unknown construct section: the declared size lets us skip
            // it.
            debug!("skipping unknown image section");
        }
        if r.pos > section_end {
            return Err(TrawlError::image_section("section payload overran", "constructs"));
        }
        r.pos = section_end;
    }

    // Materialize into a scratch engine first so failure leaves the
    // caller untouched.
    let mut fresh = TrawlEngine::with_config(crate::engine::EngineConfig {
        beta_memory_resizing: engine.get_beta_memory_resizing(),
        delay_object_pattern_matching: false,
    });
    // Atom tables first: re-interning in image order reproduces the dense
    // bucket assignment.
    for (kind, text) in &atoms.lexemes {
        fresh.atoms.intern_lexeme(*kind, text);
    }
    for bits in &atoms.floats {
        fresh.atoms.intern_float(f64::from_bits(*bits));
    }
    for value in &atoms.integers {
        fresh.atoms.intern_integer(*value);
    }
    for bitmap in &bitmaps {
        fresh.atoms.intern_bitmap(bitmap);
    }
    for (name, slots) in &templates {
        let slot_refs: Vec<&str> = slots.iter().map(String::as_str).collect();
        fresh.wm.register_template(name, &slot_refs);
    }
    for (name, slots) in &classes {
        let slot_refs: Vec<&str> = slots.iter().map(String::as_str).collect();
        fresh.wm.define_class(name, &slot_refs)?;
    }
    for rule in rules {
        fresh.add_rule(rule)?;
    }
    fresh.bload_active = true;
    fresh.watch = engine.watch.clone();
    *engine = fresh;
    info!(path = %path.display(), "binary image loaded");
    Ok(())
}
