//! timeclock-ctl: control client for the timeclock daemon.
//!
//! ## Subcommands
//!
//! - `status`, `health`: inspect the running agent
//! - `prompts`, `answer`, `watch`: list and answer clock-in/out and reminder prompts
//! - `activity`, `suspend`, `resume`: signals normally sent by the OS integration
//! - `configure`: set the worker's email and team
//! - `sync`: run one decision cycle now

mod client;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use client::{ClientError, DaemonClient};
use timeclock_core::StorageConfig;
use timeclock_daemon_protocol::{Method, PromptAnswer, PromptKindWire, PromptView};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "timeclock-ctl")]
#[command(about = "Control the timeclock daemon")]
#[command(version)]
struct Cli {
    /// Control socket (defaults to the daemon's socket under the storage root)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cached time card, loop phase and presence
    Status,

    /// Show daemon health and relaunch backoff
    Health,

    /// List open prompts
    Prompts,

    /// Answer a prompt: yes, no, a delay in minutes, or "keep" for the previous delay
    Answer {
        #[arg(value_name = "ID")]
        id: u64,

        #[arg(value_name = "ANSWER")]
        answer: String,
    },

    /// Poll for prompts and answer them interactively
    Watch,

    /// Report seconds since the last keyboard/mouse input
    Activity {
        #[arg(long)]
        idle_secs: u64,
    },

    /// Report that the machine is about to sleep
    Suspend,

    /// Report that the machine woke up
    Resume,

    /// Set the worker's mailbox and team
    Configure {
        #[arg(long)]
        email: String,

        #[arg(long)]
        team: String,
    },

    /// Run one decision cycle now
    Sync,
}

fn main() {
    let cli = Cli::parse();
    let socket = match cli.socket {
        Some(socket) => socket,
        None => match StorageConfig::resolve() {
            Ok(storage) => storage.socket_file(),
            Err(err) => {
                eprintln!("timeclock-ctl: {}", err);
                std::process::exit(1);
            }
        },
    };
    let client = DaemonClient::new(socket);

    let result = match cli.command {
        Commands::Status => print_call(&client, Method::GetStatus, None),
        Commands::Health => print_call(&client, Method::GetHealth, None),
        Commands::Prompts => print_call(&client, Method::ListPrompts, None),
        Commands::Answer { id, answer } => match parse_answer(&answer) {
            Some(answer) => answer_prompt(&client, id, answer).map(print_value),
            None => {
                eprintln!("timeclock-ctl: '{}' is not yes, no, a number of minutes or keep", answer);
                std::process::exit(2);
            }
        },
        Commands::Watch => watch(&client),
        Commands::Activity { idle_secs } => print_call(
            &client,
            Method::ReportActivity,
            Some(json!({ "idle_secs": idle_secs })),
        ),
        Commands::Suspend => print_call(
            &client,
            Method::PowerEvent,
            Some(json!({ "event": "suspend" })),
        ),
        Commands::Resume => print_call(
            &client,
            Method::PowerEvent,
            Some(json!({ "event": "resume" })),
        ),
        Commands::Configure { email, team } => print_call(
            &client,
            Method::Configure,
            Some(json!({ "email": email, "team_name": team })),
        ),
        Commands::Sync => print_call(&client, Method::SyncNow, None),
    };

    if let Err(err) = result {
        eprintln!("timeclock-ctl: {}", err);
        std::process::exit(1);
    }
}

fn print_call(client: &DaemonClient, method: Method, params: Option<Value>) -> Result<(), ClientError> {
    client.call(method, params).map(print_value)
}

fn print_value(value: Value) {
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn answer_prompt(client: &DaemonClient, id: u64, answer: PromptAnswer) -> Result<Value, ClientError> {
    client.call(
        Method::AnswerPrompt,
        Some(json!({ "id": id, "answer": answer })),
    )
}

fn parse_answer(text: &str) -> Option<PromptAnswer> {
    let text = text.trim().to_ascii_lowercase();
    match text.as_str() {
        "y" | "yes" | "true" => Some(PromptAnswer::Confirm(true)),
        "n" | "no" | "false" => Some(PromptAnswer::Confirm(false)),
        "" | "keep" | "default" => Some(PromptAnswer::DelayMinutes(None)),
        minutes => minutes
            .parse::<u32>()
            .ok()
            .map(|minutes| PromptAnswer::DelayMinutes(Some(minutes))),
    }
}

fn question(kind: PromptKindWire) -> &'static str {
    match kind {
        PromptKindWire::ClockIn => "The client is running. Clock in now? [y/n]",
        PromptKindWire::ClockOut => "The client has closed. Clock out now? [y/n]",
        PromptKindWire::ReminderDelay => {
            "Remind you to clock in after how many minutes? [Enter keeps the previous delay]"
        }
    }
}

/// Prompts not shown yet, marking them as shown.
fn take_unseen(seen: &mut HashSet<u64>, prompts: Vec<PromptView>) -> Vec<PromptView> {
    prompts
        .into_iter()
        .filter(|prompt| seen.insert(prompt.id))
        .collect()
}

fn watch(client: &DaemonClient) -> Result<(), ClientError> {
    let stdin = std::io::stdin();
    let mut seen = HashSet::new();
    println!("Watching {} for prompts (Ctrl-C to stop)", client.socket().display());

    loop {
        let listed = client.call(Method::ListPrompts, None)?;
        let prompts: Vec<PromptView> = serde_json::from_value(listed)?;

        for prompt in take_unseen(&mut seen, prompts) {
            print!("[{}] {} ", prompt.id, question(prompt.kind));
            std::io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(());
            }
            let Some(answer) = parse_answer(&line) else {
                eprintln!("Unrecognized answer; the prompt stays open");
                seen.remove(&prompt.id);
                continue;
            };
            match answer_prompt(client, prompt.id, answer) {
                Ok(_) => {}
                Err(ClientError::Daemon { code, message }) => {
                    eprintln!("{}: {}", code, message);
                    if code != "unknown_prompt" {
                        seen.remove(&prompt.id);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        sleep(WATCH_INTERVAL);
    }
}
