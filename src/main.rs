//! Preview Sandbox CLI
//!
//! Single-shot mode:
//!   preview-sandbox <source> [stylesheet] [--typescript] [--config file]
//!
//! Server mode (persistent process, reads JSON-line commands from stdin):
//!   preview-sandbox --server [--config file]
//!
//! Protocol (server mode):
//!   Request (stdin, one JSON object per line):
//!     {"command":"mount","name":"MyButton","props":{}}
//!     {"command":"source","instance":"p-1","text":"export default () => <b>hi</b>"}
//!     {"command":"stylesheet","instance":"p-1","text":"b { color: red; }"}
//!     {"command":"language","instance":"p-1","language":"typescript"}
//!     {"command":"dependencies","declarations":[{"importName":"dayjs","globalSymbolName":"dayjs","remoteUrl":"..."}]}
//!     {"command":"unmount","instance":"p-1"}
//!     {"command":"render"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <!DOCTYPE html>...
//!
//!   Error response:
//!     Status:Error
//!     Length:27
//!
//!     no mounted instance p-9

use anyhow::{anyhow, Result};
use preview_sandbox::{
    Completion, DependencyDeclaration, InstanceId, LanguageVariant, Playground, PreviewError, SandboxConfig,
};
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;

fn print_usage() {
    eprintln!("Preview Sandbox - live component previews");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  preview-sandbox <source> [stylesheet] [--typescript] [--config file]");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  preview-sandbox --server [--config file]");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  preview-sandbox ./MyButton.jsx ./MyButton.less");
    eprintln!("  preview-sandbox --server --config preview.json");
}

struct Args {
    server: bool,
    typescript: bool,
    config: Option<String>,
    files: Vec<String>,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let mut args = Args {
        server: false,
        typescript: false,
        config: None,
        files: Vec::new(),
    };

    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--server" => args.server = true,
            "--typescript" => args.typescript = true,
            "--config" => {
                let path = iter.next().ok_or_else(|| anyhow!("--config requires a file argument"))?;
                args.config = Some(path.clone());
            }
            flag if flag.starts_with("--") => return Err(anyhow!("Unknown option: {}", flag)),
            file => args.files.push(file.to_string()),
        }
    }
    Ok(args)
}

fn load_config(path: Option<&str>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::from_file(Path::new(path)),
        None => Ok(SandboxConfig::default()),
    }
}

/// Run in single-shot mode: compile one component and print the page
async fn run_single_shot(args: &Args, config: SandboxConfig) -> Result<()> {
    let source_path = &args.files[0];
    let source = std::fs::read_to_string(source_path)
        .map_err(|e| anyhow!("Failed to read '{}': {}", source_path, e))?;
    let stylesheet = match args.files.get(1) {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| anyhow!("Failed to read '{}': {}", path, e))?),
        None => None,
    };

    let name = Path::new(source_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Component")
        .to_string();

    let mut playground = Playground::with_babel(config)?;
    playground.bootstrap().await?;

    let id = playground.mount(&name, serde_json::json!({}))?;
    if args.typescript {
        playground.set_language(&id, LanguageVariant::Typescript)?;
    }
    if let Some(stylesheet) = &stylesheet {
        playground.submit_stylesheet(&id, stylesheet)?;
    }
    playground.submit_source(&id, source)?;
    playground.settle().await;

    println!("{}", playground.render_page());

    let host = playground
        .instance(&id)
        .ok_or_else(|| anyhow!("instance {} disappeared", id))?;
    if let Some(err) = host.transpile_error().or(host.stylesheet_error()).or(host.fault()) {
        return Err(anyhow!("{}", err));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
enum Command {
    Mount {
        name: String,
        #[serde(default)]
        props: serde_json::Value,
    },
    Source {
        instance: String,
        text: String,
    },
    Stylesheet {
        instance: String,
        text: String,
    },
    Language {
        instance: String,
        language: LanguageVariant,
    },
    Dependencies {
        declarations: Vec<DependencyDeclaration>,
    },
    Unmount {
        instance: String,
    },
    Render,
}

enum Event {
    Line(Option<String>),
    Completion(Option<Completion>),
    Deadline,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run in server mode (persistent process, reads commands from stdin)
async fn run_server(config: SandboxConfig) -> Result<()> {
    // Create the playground ONCE at startup (V8 cold start happens here)
    let mut playground = Playground::with_babel(config)?;
    if let Err(e) = playground.bootstrap().await {
        log::error!("{}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    // Signal ready
    log::info!("server ready, reading from stdin");

    loop {
        let deadline = playground.next_deadline();
        let event = tokio::select! {
            line = lines.next_line() => Event::Line(line?),
            completion = playground.next_completion() => Event::Completion(completion),
            _ = wait_until(deadline) => Event::Deadline,
        };

        match event {
            // EOF - stdin closed, exit gracefully
            Event::Line(None) => break,
            Event::Line(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match handle_command(&mut playground, &line).await {
                    Ok(body) => write_response(&mut stdout, true, &body)?,
                    Err(e) => write_response(&mut stdout, false, &e.to_string())?,
                }
            }
            Event::Completion(Some(completion)) => playground.apply(completion),
            Event::Completion(None) => return Err(anyhow!("transform worker stopped")),
            Event::Deadline => {
                if let Err(e) = playground.flush_due(Instant::now()) {
                    log::error!("failed to submit edits: {}", e);
                }
            }
        }
    }

    log::info!("server shutting down");
    Ok(())
}

async fn handle_command(playground: &mut Playground, line: &str) -> Result<String> {
    let command: Command = serde_json::from_str(line).map_err(|e| anyhow!("Invalid command: {}", e))?;

    match command {
        Command::Mount { name, props } => {
            let props = if props.is_null() { serde_json::json!({}) } else { props };
            Ok(playground.mount(&name, props)?.to_string())
        }
        Command::Source { instance, text } => {
            let id = lookup(playground, &instance)?;
            playground.edit_source(&id, text, Instant::now())?;
            Ok(String::new())
        }
        Command::Stylesheet { instance, text } => {
            let id = lookup(playground, &instance)?;
            playground.edit_stylesheet(&id, text, Instant::now())?;
            Ok(String::new())
        }
        Command::Language { instance, language } => {
            let id = lookup(playground, &instance)?;
            playground.set_language(&id, language)?;
            Ok(String::new())
        }
        Command::Dependencies { declarations } => {
            let failures = playground.declare_dependencies(&declarations).await;
            Ok(failures
                .iter()
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Command::Unmount { instance } => {
            let id = lookup(playground, &instance)?;
            playground.unmount(&id)?;
            Ok(String::new())
        }
        Command::Render => {
            playground.flush_all()?;
            playground.settle().await;
            Ok(playground.render_page())
        }
    }
}

fn lookup(playground: &Playground, token: &str) -> Result<InstanceId, PreviewError> {
    playground
        .find_instance(token)
        .ok_or_else(|| PreviewError::UnknownInstance(token.to_string()))
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let length = body.len();

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", length)?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };
    let config = load_config(args.config.as_deref())?;

    // Check for server mode
    if args.server {
        return run_server(config).await;
    }

    // Single-shot mode
    if args.files.is_empty() {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    run_single_shot(&args, config).await
}
