use std::env;

use nimmy_parser::parse_program;
use nimmy_vm::{format_value, NimmyError, Value, Vm};

fn print_usage() {
    eprintln!("nimmy - an embeddable scripting language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  nimmy <file.nim>         Run a script");
    eprintln!("  nimmy -e <code>          Evaluate a code fragment");
    eprintln!("  nimmy --ast <file.nim>   Print the parsed program as JSON");
    eprintln!("  nimmy repl               Start an interactive session");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
        }
        "--version" | "-V" => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        "-e" => {
            let Some(code) = args.get(2) else {
                eprintln!("error: -e requires a code argument");
                std::process::exit(1);
            };
            run_source(code);
        }
        "--ast" => {
            let Some(path) = args.get(2) else {
                eprintln!("error: --ast requires a file argument");
                std::process::exit(1);
            };
            dump_ast(path);
        }
        "repl" => {
            run_repl();
        }
        path => {
            run_script(path);
        }
    }
}

fn run_script(path: &str) {
    let mut vm = Vm::new();
    match vm.run_file(path) {
        Ok(output) => print!("{output}"),
        Err(err) => {
            report(&err, Some(path));
            std::process::exit(1);
        }
    }
}

fn run_source(code: &str) {
    let mut vm = Vm::new();
    match vm.run(code) {
        Ok(output) => print!("{output}"),
        Err(err) => {
            report(&err, None);
            std::process::exit(1);
        }
    }
}

fn dump_ast(path: &str) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{path}: {err}");
            std::process::exit(1);
        }
    };
    match parse_program(&source) {
        Ok(program) => match serde_json::to_string_pretty(&program) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("failed to serialise program: {err}");
                std::process::exit(1);
            }
        },
        Err(err) => {
            eprintln!("{path}: {err}");
            std::process::exit(1);
        }
    }
}

fn report(err: &NimmyError, path: Option<&str>) {
    match path {
        Some(path) => eprintln!("{path}: {err}"),
        None => eprintln!("{err}"),
    }
}

/// An interactive session over a single persistent VM. Every line runs
/// through the interactive evaluator, so bindings survive between lines
/// and a broken line never poisons the session.
fn run_repl() {
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = std::env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".nimmy_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    let mut vm = Vm::new();
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };

        if buffer.is_empty() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "exit" || trimmed == ".exit" {
                break;
            }
        }
        let _ = rl.add_history_entry(line.trim_end());
        buffer.push_str(&line);
        buffer.push('\n');

        // Block headers (`proc f() =`, `if x:`) continue onto indented
        // lines; keep reading until the input stops opening blocks.
        if expects_continuation(&buffer, &line) {
            continue;
        }

        let result = vm.run_interactive(&buffer);
        buffer.clear();
        for line in &result.output {
            println!("{line}");
        }
        if let Some(error) = &result.error {
            eprintln!("{error}");
        } else if !matches!(result.value, Value::Nil) {
            println!("{}", format_value(&result.value));
        }
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}

/// More input is expected while the last line opens a block, or until a
/// blank line closes a multi-line entry.
fn expects_continuation(buffer: &str, last_line: &str) -> bool {
    let trimmed = last_line.trim_end();
    if trimmed.ends_with(':') || trimmed.ends_with('=') {
        return true;
    }
    buffer.lines().count() > 1 && !trimmed.is_empty()
}
