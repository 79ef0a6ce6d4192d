use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};

use silt::loader::FunctionKind;
use silt::module::{ExportDescriptor, Module};
use silt::{Context, DirectorySource, Value};

#[derive(Parser)]
#[command(name = "silt")]
#[command(about = "Bytecode VM and runtime for the silt scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and invoke one of its functions.
    Run {
        #[arg(help = "Module import name, e.g. examples::hello")]
        module: String,

        #[arg(help = "Function to invoke")]
        function: String,

        #[arg(help = "Arguments (i32, f32 or str, inferred from the spelling)")]
        args: Vec<String>,

        #[arg(short, long, default_value = ".", help = "Module search root")]
        root: PathBuf,

        #[arg(long, default_value_t = 500, help = "Maximum call stack depth")]
        max_call_depth: usize,
    },
    /// Print a module's header tables and rewritten code.
    Dump {
        #[arg(help = "Module file")]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Run {
            module,
            function,
            args,
            root,
            max_call_depth,
        } => run(&module, &function, &args, root, max_call_depth),
        Commands::Dump { input } => dump(&input),
    }
}

fn run(
    module: &str,
    function: &str,
    args: &[String],
    root: PathBuf,
    max_call_depth: usize,
) -> Result<()> {
    let source = DirectorySource::new(root);
    let mut ctx = Context::with_limits(Box::new(source), max_call_depth);
    silt::runtime::register(&mut ctx).context("registering the std runtime")?;

    let args: Vec<Value> = args.iter().map(|raw| parse_argument(raw)).collect();
    let result = ctx
        .invoke(module, function, &args)
        .with_context(|| format!("invoking {module}.{function}"))?;

    match result {
        Value::Void => {}
        Value::I32(v) => println!("{v}"),
        Value::F32(v) => println!("{v}"),
        Value::Str(s) => println!("{s}"),
        other => println!("{other:?}"),
    }
    Ok(())
}

/// Integers become i32, numbers with a decimal point f32, everything else a
/// string.
fn parse_argument(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i32>() {
        return Value::I32(v);
    }
    if raw.contains('.') {
        if let Ok(v) = raw.parse::<f32>() {
            return Value::F32(v);
        }
    }
    Value::Str(raw.to_owned())
}

fn dump(input: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let module = Module::parse(&bytes).context("parsing module")?;

    println!("; constants");
    for (i, c) in module.header.constants.iter().enumerate() {
        println!("  {i}: {c:?}");
    }

    println!("; imports");
    for (i, imp) in module.header.imports.iter().enumerate() {
        println!("  {i}: {} '{}'", imp.kind.name(), imp.name);
    }

    println!("; exports");
    for (i, exp) in module.header.exports.iter().enumerate() {
        println!("  {i}: {} '{}'", exp.desc.kind().name(), exp.name);
    }

    // Loading resolves imports and rewrites the code; it only succeeds for
    // modules whose imports are available next to the input file.
    let Some(stem) = input.file_stem().and_then(|s| s.to_str()) else {
        bail!("cannot derive a module name from {}", input.display());
    };
    let root = input.parent().map(PathBuf::from).unwrap_or_default();

    let mut ctx = Context::new(Box::new(DirectorySource::new(root)));
    silt::runtime::register(&mut ctx)?;
    match ctx.resolve_module(stem) {
        Ok(mid) => {
            let loader = ctx.loader(mid);
            println!("; disassembly");
            for f in loader.functions() {
                match &f.kind {
                    FunctionKind::Native { library, .. } => {
                        println!("  {} (native, library '{library}')", f.name);
                    }
                    FunctionKind::Bytecode(body) => {
                        println!(
                            "  {} (locals {} bytes, stack {} bytes)",
                            f.name, body.locals_size, body.stack_size
                        );
                        for pc in body.entry..body.entry + body.len {
                            println!("    {pc:4}: {}", loader.code[pc]);
                        }
                    }
                }
            }
        }
        Err(err) => println!("; not disassembled: {err}"),
    }

    // Struct layouts are interesting when debugging field offsets.
    for exp in &module.header.exports {
        if let ExportDescriptor::Type(_) = exp.desc {
            if let Some(desc) = ctx
                .loader_by_name(stem)
                .and_then(|loader| loader.struct_descriptor(&exp.name))
            {
                println!(
                    "; type {} (size {}, alignment {})",
                    exp.name, desc.size, desc.alignment
                );
            }
        }
    }

    Ok(())
}
