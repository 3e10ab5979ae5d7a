use anyhow::Result;
use rill::{install_defaults, Compiler, Lexer, Parser, VirtualMachine};
use rustyline::{error::ReadlineError, Editor};

fn main() -> Result<()> {
    println!(
        r"
Welcome to the rill REPL!
You may type rill code below for evaluation.
Enter 'dump' to inspect the VM state, 'exit' or CTRL+C to leave.
    "
    );

    let mut rl = Editor::<()>::new();
    if rl.load_history("history.txt").is_err() {
        println!("No previous history.");
    }

    let mut accumulated_code = String::new();
    let mut last_vm: Option<VirtualMachine> = None;

    loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) => match line.as_ref() {
                "exit" => break,
                "dump" => {
                    if let Some(vm) = &last_vm {
                        print!("{}", vm.dump());
                    }
                }
                line => {
                    rl.add_history_entry(line);

                    let test_code = format!("{}\n{}", accumulated_code, line);

                    let mut lexer = Lexer::new(&test_code);
                    let tokens = match lexer.tokenize() {
                        Ok(tokens) => tokens,
                        Err(error) => {
                            eprintln!("Error lexing: {}", error);
                            continue;
                        }
                    };

                    let mut parser = Parser::new(&tokens);
                    let statements = match parser.parse() {
                        Ok(statements) => statements,
                        Err(error) => {
                            eprintln!("Error parsing: {}", error);
                            continue;
                        }
                    };

                    let mut compiler = Compiler::new(&statements);
                    let bytecode = match compiler.compile() {
                        Ok(bytecode) => bytecode,
                        Err(error) => {
                            eprintln!("Error compiling: {}", error);
                            continue;
                        }
                    };

                    let mut vm = VirtualMachine::new();
                    install_defaults(&mut vm);

                    if let Err(error) = vm.execute(&bytecode) {
                        eprintln!("Error running: {}", error);
                        continue;
                    }

                    accumulated_code = test_code;
                    last_vm = Some(vm);
                }
            },
            Err(ReadlineError::Interrupted) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history("history.txt")?;
    Ok(())
}
