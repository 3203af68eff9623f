//! A minimal demonstration binary: wires a `Parser` + `FileSystem` +
//! `CommandExecutor` into `mlld::interpret` and prints the rendered
//! document. Not a feature-complete CLI — the real parser, filesystem, and
//! shell executor are out of this crate's scope (§1); this binary exists
//! only to show how a host assembles `RootEnvironmentDeps`.

use std::io::Read;
use std::sync::Arc;

use clap::Parser as ClapParser;

use mlld::interpreter::effects::CollectingEffectHandler;
use mlld::{Environment, RootEnvironmentDeps};

#[derive(ClapParser)]
#[command(name = "mlld")]
#[command(about = "Evaluate an mlld document (demonstration binary)")]
#[command(version)]
struct Cli {
    /// Evaluate the document passed directly on the command line.
    #[arg(short = 'c')]
    script: Option<String>,

    /// Output the rendered document as JSON (`{"doc": "..."}`).
    #[arg(long = "json")]
    json: bool,

    /// Document file to evaluate.
    #[arg()]
    script_file: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let source = if let Some(s) = cli.script {
        s
    } else if let Some(ref file) = cli.script_file {
        match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error: cannot read document file: {file}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        use std::io::IsTerminal;
        if std::io::stdin().is_terminal() {
            eprintln!("Error: no document provided. Use -c '<doc>', a file argument, or pipe via stdin.");
            std::process::exit(1);
        }
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).unwrap_or_default();
        buf
    };

    let effect_handler = Arc::new(CollectingEffectHandler::new());
    let deps = RootEnvironmentDeps { effect_handler: effect_handler.clone(), ..Default::default() };

    let result: Result<Arc<Environment>, _> = mlld::interpret(&source, deps).await;

    match result {
        Ok(_env) => {
            let doc = effect_handler.render_document().await;
            if cli.json {
                println!("{}", serde_json::json!({ "doc": doc }));
            } else {
                print!("{doc}");
            }
        }
        Err(err) => {
            if cli.json {
                println!("{}", serde_json::json!({ "error": err.to_string() }));
            } else {
                eprintln!("Error: {err}");
            }
            std::process::exit(1);
        }
    }
}
