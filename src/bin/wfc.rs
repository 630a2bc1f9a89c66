//! Command-line front-end: compile WASM modules into a native
//! library. Runs the full ingest/validate/link pipeline; without a
//! code generator linked in, emission is a dry run.

use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use wasmforge::{EmbeddingSource, EnvFlags, Environment, NullBackend, OptimizeLevel};

#[derive(StructOpt, Debug)]
#[structopt(name = "wfc", about = "Ahead-of-time WebAssembly compiler")]
struct Opt {
    /// Input modules (.wasm or .wat), named after their file stems.
    #[structopt(parse(from_os_str), required = true)]
    inputs: Vec<PathBuf>,

    /// Output library path.
    #[structopt(short = "o", long, parse(from_os_str), default_value = "out.so")]
    output: PathBuf,

    /// Whitelist a native import as module:export (repeatable).
    #[structopt(short = "w", long = "whitelist")]
    whitelist: Vec<String>,

    /// Embed a native library whose exports become import targets
    /// (repeatable).
    #[structopt(short = "l", long = "embed", parse(from_os_str))]
    embeddings: Vec<PathBuf>,

    /// Optimization level, 0-3.
    #[structopt(short = "O", default_value = "3")]
    optimize: u8,

    /// Maximum parallel module loaders; 0 loads serially.
    #[structopt(short = "j", long, default_value = "4")]
    threads: usize,

    /// Allow direct syscalls in generated code.
    #[structopt(long)]
    no_sandbox: bool,

    /// Reject textual modules.
    #[structopt(long)]
    no_wat: bool,

    /// Preserve name sections and emit debug info.
    #[structopt(short = "g", long)]
    debug: bool,

    /// Reject questionable constructs that are merely discouraged.
    #[structopt(long)]
    strict: bool,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(opt: &Opt) -> anyhow::Result<()> {
    let arg0 = std::env::args().next().unwrap_or_default();
    let mut env = Environment::new(Arc::new(NullBackend), opt.inputs.len(), opt.threads, &arg0);

    if opt.no_sandbox {
        env.flags.remove(EnvFlags::SANDBOX);
    }
    if !opt.no_wat {
        env.flags |= EnvFlags::ENABLE_WAT;
    }
    if opt.threads > 0 && opt.inputs.len() > 1 {
        env.flags |= EnvFlags::MULTITHREADED;
    }
    if opt.debug {
        env.flags |= EnvFlags::DEBUG;
    }
    if opt.strict {
        env.flags |= EnvFlags::STRICT;
    }
    if !opt.whitelist.is_empty() {
        env.flags |= EnvFlags::WHITELIST;
    }
    env.optimize = match opt.optimize {
        0 => OptimizeLevel::O0,
        1 => OptimizeLevel::O1,
        2 => OptimizeLevel::O2,
        _ => OptimizeLevel::O3,
    };

    for entry in &opt.whitelist {
        match entry.split_once(':') {
            Some((module, export)) => env.add_whitelist(module, export),
            None => anyhow::bail!("whitelist entry {:?} is not module:export", entry),
        }
    }
    for path in &opt.embeddings {
        env.add_embedding(0, EmbeddingSource::Path(path.clone()));
    }
    for input in &opt.inputs {
        env.add_module_file(input, None)?;
    }

    env.finalize()?;
    match env.compile(&opt.output) {
        Ok(()) => {
            log::info!("compiled {} module(s) to {}", env.modules().len(), opt.output.display());
            Ok(())
        }
        Err(e) => {
            for error in env.errors() {
                eprintln!("{}", error);
            }
            Err(e)
        }
    }
}
