//! Interactive REPL.

use crate::commands::{format_entries, format_event, format_json};
use colored::Colorize;
use kvlink_client::Client;
use kvlink_core::SessionEvent;
use kvlink_protocol::message::RangeParams;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::json;
use std::path::PathBuf;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  ping                          Ping the server
  info                          Show what the server exposes
  status                        Show the session state

  get <key>                     Get a value
  put <key> <value>             Set a key
  del <key>                     Delete a key
  range [gte] [lte] [limit]     List keys in order

  auth <name> <password>        Authenticate this stream
  deauth                        Drop authentication

  quit, exit                    Exit the REPL
"#;

fn history_path() -> PathBuf {
    home::home_dir()
        .map(|h| h.join(".kvlink_history"))
        .unwrap_or_else(|| ".kvlink_history".into())
}

pub async fn run(client: Client) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "kvlink CLI".bold().cyan());
    println!("Session with {}", client.config().address());

    // Reconnects happen in the background; surface them between prompts
    let mut events = client.subscribe();
    let notifier = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(
                event.event,
                SessionEvent::Connect | SessionEvent::Error { .. } | SessionEvent::Reconnecting { .. }
            ) {
                eprintln!("{}", format_event(&event));
            }
        }
    });

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = history_path();
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "kvlink>".cyan());
        // rustyline blocks; keep the runtime's other tasks moving meanwhile
        let readline = tokio::task::block_in_place(|| rl.readline(&prompt));
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    notifier.abort();
    drop(client);
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];
    let db = client.db();

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "status" => Ok(Some(format!(
            "State: {}  Connected: {}  Retry attempts: {}",
            client.state().to_string().yellow(),
            db.is_connected(),
            client.reconnect_attempts()
        ))),

        "ping" => {
            db.ping().await?;
            Ok(Some("PONG".green().to_string()))
        }

        "info" => match db.server() {
            Some(server) => Ok(Some(format_json(&serde_json::to_value(server)?))),
            None => Ok(Some("Not connected".yellow().to_string())),
        },

        "get" | "g" => {
            let Some(key) = args.first() else {
                return Ok(Some("Usage: get <key>".to_string()));
            };
            match db.get(key).await? {
                Some(value) => Ok(Some(value)),
                None => Ok(Some(format!("{} {}", "Not found:".yellow(), key.cyan()))),
            }
        }

        "put" | "p" => {
            if args.len() < 2 {
                return Ok(Some("Usage: put <key> <value>".to_string()));
            }
            let value = args[1..].join(" ");
            db.put(args[0], &value).await?;
            Ok(Some(format!("{} {}", "OK".green(), args[0].cyan())))
        }

        "del" | "d" => {
            let Some(key) = args.first() else {
                return Ok(Some("Usage: del <key>".to_string()));
            };
            db.del(key).await?;
            Ok(Some(format!("{} {}", "Deleted".green(), key.cyan())))
        }

        "range" | "r" => {
            let params = RangeParams {
                gte: args.first().map(|s| s.to_string()),
                lte: args.get(1).map(|s| s.to_string()),
                limit: args.get(2).map(|s| s.parse()).transpose()?,
                reverse: false,
            };
            let entries = db.range(params).await?;
            Ok(Some(format_entries(&entries)))
        }

        "auth" => {
            if args.len() < 2 {
                return Ok(Some("Usage: auth <name> <password>".to_string()));
            }
            let user = db
                .auth(json!({"name": args[0], "password": args[1]}))
                .await?;
            Ok(Some(format!("{} as {}", "Authenticated".green(), user)))
        }

        "deauth" => {
            db.deauth().await?;
            Ok(Some("Deauthenticated".green().to_string()))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
