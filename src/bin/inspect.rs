//! `blockform-inspect`: a thin read-only demonstrator of the public API.
//!
//! Opens a file against the crate's built-in format registry (or a
//! user-supplied schema for `schema-check`) and prints its block graph.
//! This is not the CLI "toaster" driver spec.md places out of scope: it
//! carries no directory walking and no transform dispatch, just enough to
//! see that a file opened the way the library intends.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use blockform::graph::traversal::Order;
use blockform::schema::loader::load_schema;
use blockform::value::Value;
use blockform::FormatRegistry;

/// Inspect block-structured files through the `blockform` kernel.
#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Open a file with the crate's built-in formats and print every block.
    Inspect(InspectArgs),
    /// Load a schema source and report whether it resolves cleanly.
    SchemaCheck(SchemaCheckArgs),
}

#[derive(Clone, Debug, Parser)]
struct InspectArgs {
    /// file to open
    input: PathBuf,
    /// also print warnings accumulated while loading
    #[arg(long)]
    warnings: bool,
}

#[derive(Clone, Debug, Parser)]
struct SchemaCheckArgs {
    /// schema XML source to load
    input: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.operation {
        Operation::Inspect(inspect_args) => inspect(inspect_args),
        Operation::SchemaCheck(check_args) => schema_check(check_args),
    }
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let registry = FormatRegistry::builtin();
    let mut reader = BufReader::new(
        File::open(&args.input)
            .with_context(|| format!("opening {}", args.input.display()))?,
    );
    let report = registry
        .open(&mut reader)
        .with_context(|| format!("loading {}", args.input.display()))?;

    log::info!(
        "loaded {} block(s), version {:#010x}, user_version {:#010x}",
        report.graph.len(),
        report.graph.version,
        report.graph.user_version
    );

    report.graph.walk(report.graph.roots(), Order::Pre, true, |id, instance| {
        println!("{id} {}", instance.compound);
        for (i, name) in instance.compound_fields().iter().enumerate() {
            match instance.fields.get(i).and_then(|v| v.as_ref()) {
                Some(value) => println!("    {name} = {}", describe(value)),
                None => println!("    {name} = <absent>"),
            }
        }
    });

    if args.warnings {
        for warning in &report.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::EnumValue { enum_name, raw } => format!("{enum_name}({raw})"),
        Value::BitfieldValue { def_name, raw } => format!("{def_name}({raw:#x})"),
        Value::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Instance(inst) => format!("<{} instance>", inst.compound),
        Value::Array(arr) => format!("<array of {} item(s)>", arr.items.len()),
        Value::Link(link) => format!("{link:?}"),
    }
}

fn schema_check(args: &SchemaCheckArgs) -> Result<()> {
    let mut reader = BufReader::new(
        File::open(&args.input)
            .with_context(|| format!("opening {}", args.input.display()))?,
    );
    let schema = load_schema_from(&mut reader)?;
    let count = schema.compound_names().count();
    println!("schema OK: {count} compound(s) defined");
    Ok(())
}

fn load_schema_from(reader: &mut impl std::io::Read) -> Result<blockform::Schema> {
    let mut xml = String::new();
    std::io::Read::read_to_string(reader, &mut xml)?;
    Ok(load_schema(&xml)?)
}
