//! Thin CLI driver: `goat run <file>` compiles and evaluates a script
//! through the public embedding API. `anyhow` is used only at this
//! boundary — library code returns the crate's own typed `Error`.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};

use goatvm::loader::RealFs;
use goatvm::vm::{RunOptions, Vm, VmOptions};

#[derive(ClapParser)]
#[command(name = "goat", about = "A small Go-shaped scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a `.goat` source file.
    Run {
        file: String,
        #[arg(long)]
        dump_tree: bool,
        #[arg(long)]
        dump_code: bool,
        #[arg(long)]
        no_optimize: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            file,
            dump_tree,
            dump_code,
            no_optimize,
        } => run(&file, dump_tree, dump_code, no_optimize),
    }
}

fn run(path: &str, dump_tree: bool, dump_code: bool, no_optimize: bool) -> Result<()> {
    let source = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let root = std::path::Path::new(path)
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .to_path_buf();
    let stdout: Rc<RefCell<dyn std::io::Write>> = Rc::new(RefCell::new(std::io::stdout()));
    let mut vm = Vm::new(
        VmOptions::default()
            .with_stdout(stdout)
            .with_loaders(Rc::new(RealFs { root })),
    );
    let opts = RunOptions::default()
        .with_tree_dump(dump_tree)
        .with_code_dump(dump_code)
        .with_optimize(!no_optimize)
        .with_eval_imports(true);
    let result = vm.eval(&source, &opts)?;
    if !result.is_nil() {
        println!("{result}");
    }
    Ok(())
}
