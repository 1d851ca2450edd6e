//! Trawl command-line front end.
//!
//! Loads a rule set (and optionally working memory) from JSON, then runs
//! one engine command: fire the agenda, inspect matches or join activity,
//! or save/load a binary image.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use trawl_core::{binary_image, Rule, TrawlEngine, Verbosity};
use trawl_types::Value;

#[derive(Parser)]
#[command(name = "trawl", version, about = "Forward-chaining production rule engine")]
struct Cli {
    /// Rule set file (JSON: { classes: [...], rules: [...] }).
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Working-memory file (JSON array of facts and instances).
    #[arg(long, global = true)]
    facts: Option<PathBuf>,

    /// Enable a watch item (repeatable): facts, instances, rules,
    /// activations, compilations, all.
    #[arg(long = "watch", global = true)]
    watch: Vec<String>,

    /// Enable or disable beta memory resizing.
    #[arg(long, global = true)]
    beta_resizing: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assert working memory, fire the agenda, print a summary.
    Run {
        /// Stop after this many rule firings.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report matches for a rule by name.
    Matches {
        rule: String,
        #[arg(long, conflicts_with = "terse")]
        succinct: bool,
        #[arg(long)]
        terse: bool,
    },
    /// Report per-rule join activity.
    JoinActivity {
        /// Zero the counters after reporting.
        #[arg(long)]
        reset: bool,
    },
    /// Save a binary image of the loaded constructs.
    Bsave { path: PathBuf },
    /// Restore constructs from a binary image, then assert working
    /// memory and fire.
    Bload {
        path: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List watch items and their state.
    ListWatchItems,
    /// Print whether beta memory resizing is enabled.
    GetBetaMemoryResizing,
}

#[derive(Deserialize, Default)]
struct RuleSetFile {
    #[serde(default)]
    classes: Vec<ClassDef>,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Deserialize)]
struct ClassDef {
    name: String,
    slots: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkingMemoryEntry {
    Instance { class: String, name: String, #[serde(default)] slots: serde_json::Map<String, serde_json::Value> },
    Fact { template: String, #[serde(default)] slots: serde_json::Map<String, serde_json::Value> },
}

fn json_to_value(value: &serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::String(s) => Value::Symbol(s.clone()),
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                bail!("unsupported number: {n}");
            }
        }
        serde_json::Value::Array(items) => {
            Value::Multifield(items.iter().map(json_to_value).collect::<Result<_>>()?)
        }
        other => bail!("unsupported slot value: {other}"),
    })
}

fn load_rules(engine: &mut TrawlEngine, path: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read rule set {}", path.display()))?;
    let file: RuleSetFile = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse rule set {}", path.display()))?;
    for class in &file.classes {
        let slots: Vec<&str> = class.slots.iter().map(String::as_str).collect();
        engine.define_class(&class.name, &slots)?;
    }
    for rule in file.rules {
        engine.add_rule(rule)?;
    }
    Ok(())
}

fn load_working_memory(engine: &mut TrawlEngine, path: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read working memory {}", path.display()))?;
    let entries: Vec<WorkingMemoryEntry> = serde_json::from_str(&text)
        .with_context(|| format!("cannot parse working memory {}", path.display()))?;
    for entry in entries {
        match entry {
            WorkingMemoryEntry::Fact { template, slots } => {
                let mut values = Vec::new();
                for (slot, value) in &slots {
                    values.push((slot.as_str(), json_to_value(value)?));
                }
                engine.assert_fact(&template, values)?;
            }
            WorkingMemoryEntry::Instance { class, name, slots } => {
                let mut values = Vec::new();
                for (slot, value) in &slots {
                    values.push((slot.as_str(), json_to_value(value)?));
                }
                engine.make_instance(&name, &class, values)?;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut engine = TrawlEngine::new();

    if let Some(enabled) = cli.beta_resizing {
        engine.set_beta_memory_resizing(enabled);
    }
    for item in &cli.watch {
        if !engine.watch(item) {
            bail!("unknown watch item '{item}'");
        }
    }

    match cli.command {
        Command::Run { limit } => {
            if let Some(rules) = &cli.rules {
                load_rules(&mut engine, rules)?;
            }
            if let Some(facts) = &cli.facts {
                load_working_memory(&mut engine, facts)?;
            }
            let fired = engine.run(limit);
            println!("{} rules fired", fired);
            println!("{}", engine.stats());
        }
        Command::Matches { rule, succinct, terse } => {
            if let Some(rules) = &cli.rules {
                load_rules(&mut engine, rules)?;
            }
            if let Some(facts) = &cli.facts {
                load_working_memory(&mut engine, facts)?;
            }
            let rule_id = engine
                .rule_id_by_name(&rule)
                .with_context(|| format!("no rule named '{rule}'"))?;
            let verbosity = if terse {
                Verbosity::Terse
            } else if succinct {
                Verbosity::Succinct
            } else {
                Verbosity::Verbose
            };
            print!("{}", engine.matches(rule_id, verbosity)?);
        }
        Command::JoinActivity { reset } => {
            if let Some(rules) = &cli.rules {
                load_rules(&mut engine, rules)?;
            }
            if let Some(facts) = &cli.facts {
                load_working_memory(&mut engine, facts)?;
            }
            for activity in engine.join_activity() {
                println!("{activity}");
            }
            if reset {
                engine.join_activity_reset();
                println!("join activity counters reset");
            }
        }
        Command::Bsave { path } => {
            if let Some(rules) = &cli.rules {
                load_rules(&mut engine, rules)?;
            }
            binary_image::bsave(&mut engine, &path)?;
            println!("image saved to {}", path.display());
        }
        Command::Bload { path, limit } => {
            binary_image::bload(&mut engine, &path)?;
            if let Some(facts) = &cli.facts {
                load_working_memory(&mut engine, facts)?;
            }
            let fired = engine.run(limit);
            println!("{} rules fired", fired);
            println!("{}", engine.stats());
        }
        Command::ListWatchItems => {
            for (name, enabled) in engine.list_watch_items() {
                println!("{name} = {}", if enabled { "on" } else { "off" });
            }
        }
        Command::GetBetaMemoryResizing => {
            println!("{}", engine.get_beta_memory_resizing());
        }
    }
    Ok(())
}
