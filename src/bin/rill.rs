use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use rill::{
    install_defaults, Compiler, Lexer, Parser as RillParser, VirtualMachine,
};

#[derive(Parser)]
#[command(name = "rill")]
#[command(about = "The rill scripting language")]
struct Cli {
    file: String,

    /// Print the compiled bytecode listing before executing.
    #[arg(long)]
    bytecode: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = fs::read_to_string(&cli.file)
        .with_context(|| format!("Failed to read file: {}", cli.file))?;

    let mut lexer = Lexer::new(&source);
    let tokens = lexer.tokenize().context("Lexer error")?;

    let mut parser = RillParser::new(&tokens);
    let statements = parser.parse().context("Parser error")?;

    let mut compiler = Compiler::new(&statements);
    let bytecode = compiler.compile().context("Compiler error")?;

    if cli.bytecode {
        print!("{}", bytecode);
    }

    let mut vm = VirtualMachine::new();
    install_defaults(&mut vm);
    vm.execute(&bytecode).context("Runtime error")?;

    Ok(())
}
