//! Command execution.

use crate::Commands;
use colored::Colorize;
use kvlink_client::Db;
use kvlink_core::{EventEnvelope, SessionEvent};
use kvlink_protocol::message::{BatchOp, Entry, RangeParams};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Executes a command and returns the formatted output.
pub async fn execute(db: &Db, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl | Commands::Watch | Commands::HashPassword { .. } => unreachable!(),

        Commands::Ping => {
            db.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => match db.server() {
            Some(server) => Ok(format_json(&serde_json::to_value(server)?)),
            None => Ok("Not connected".yellow().to_string()),
        },

        Commands::Get { key } => match db.get(&key).await? {
            Some(value) => Ok(value),
            None => Ok(format!("{} {}", "Not found:".yellow(), key.cyan())),
        },

        Commands::Put { key, value } => {
            db.put(&key, &value).await?;
            Ok(format!("{} {}", "OK".green(), key.cyan()))
        }

        Commands::Del { key } => {
            db.del(&key).await?;
            Ok(format!("{} {}", "Deleted".green(), key.cyan()))
        }

        Commands::Batch { ops } => {
            let ops: Vec<BatchOp> = serde_json::from_value(parse_json_arg(&ops)?)?;
            let applied = db.batch(ops).await?;
            Ok(format!("{} {} operations", "Applied".green(), applied))
        }

        Commands::Range {
            gte,
            lte,
            limit,
            reverse,
        } => {
            let entries = db
                .range(RangeParams {
                    gte,
                    lte,
                    limit,
                    reverse,
                })
                .await?;
            Ok(format_entries(&entries))
        }
    }
}

/// Parses a JSON argument, reading it from a file when prefixed with `@`.
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn format_entries(entries: &[Entry]) -> String {
    if entries.is_empty() {
        return "No entries".yellow().to_string();
    }
    entries
        .iter()
        .map(|entry| format!("{} = {}", entry.key.cyan(), entry.value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per session event.
pub fn format_event(envelope: &EventEnvelope) -> String {
    let origin = envelope.source.to_string().dimmed();
    match &envelope.event {
        SessionEvent::Error { kind, message } => {
            format!("{} {} {}: {}", origin, "error".red(), kind, message)
        }
        SessionEvent::Connect => format!("{} {}", origin, "connect".green()),
        SessionEvent::Close => format!("{} {}", origin, "close".yellow()),
        SessionEvent::Reconnecting { attempts, delay } => format!(
            "{} {} attempt {} (next in {}ms)",
            origin,
            "reconnecting".yellow(),
            attempts,
            delay.as_millis()
        ),
        other => format!("{} {}", origin, other.name()),
    }
}

/// Lowercase hex SHA-256, as expected in the server's auth config.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlink_core::{ErrorKind, OriginTag};
    use std::time::Duration;

    #[test]
    fn test_hash_password() {
        assert_eq!(
            hash_password("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
        assert_ne!(hash_password("p@ss"), hash_password("p@sS"));
    }

    #[test]
    fn test_parse_json_arg() {
        let value = parse_json_arg(r#"[{"type":"del","key":"a"}]"#).unwrap();
        let ops: Vec<BatchOp> = serde_json::from_value(value).unwrap();
        assert_eq!(ops, vec![BatchOp::Del { key: "a".into() }]);
        assert!(parse_json_arg("not json").is_err());
        assert!(parse_json_arg("@/nonexistent/ops.json").is_err());
    }

    #[test]
    fn test_format_event() {
        colored::control::set_override(false);
        let line = format_event(&EventEnvelope::new(
            OriginTag::LevelServer,
            SessionEvent::Reconnecting {
                attempts: 2,
                delay: Duration::from_millis(2000),
            },
        ));
        assert!(line.contains("reconnecting attempt 2 (next in 2000ms)"));

        let line = format_event(&EventEnvelope::new(
            OriginTag::Database,
            SessionEvent::Error {
                kind: ErrorKind::Access,
                message: "denied".into(),
            },
        ));
        assert!(line.ends_with(": denied"));
    }

    #[test]
    fn test_format_entries() {
        colored::control::set_override(false);
        assert_eq!(format_entries(&[]), "No entries");
        let entries = vec![
            Entry {
                key: "a".into(),
                value: "1".into(),
            },
            Entry {
                key: "b".into(),
                value: "2".into(),
            },
        ];
        assert_eq!(format_entries(&entries), "a = 1\nb = 2");
    }
}
