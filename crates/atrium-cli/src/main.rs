use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "atrium", about = "Atrium condominium vision CLI")]
struct Cli {
    /// Base URL of atriumd
    #[arg(long, default_value = "http://127.0.0.1:8088", global = true)]
    url: String,

    /// Request timeout in seconds (video jobs can take several minutes)
    #[arg(long, default_value_t = 1800, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image for a user
    Enroll {
        #[arg(long)]
        user_id: i64,
        /// Enroll as a visitor instead of a resident
        #[arg(long)]
        visitor: bool,
        image: PathBuf,
    },
    /// Match a face image against enrolled users
    Login {
        /// Open a visitor session on match
        #[arg(long)]
        visitor: bool,
        image: PathBuf,
    },
    /// Close a visitor's open session
    Logout {
        #[arg(long)]
        user_id: i64,
    },
    /// Revoke a user's face identity
    Revoke {
        #[arg(long)]
        user_id: i64,
        /// Also delete the descriptor from the vision provider
        #[arg(long)]
        purge: bool,
    },
    /// Show the face collection size and its first few entries
    Faces,
    /// Vehicle plate operations
    Plate {
        #[command(subcommand)]
        command: PlateCommand,
    },
    /// Upload a video and run event detection
    Video {
        file: PathBuf,
        #[arg(long)]
        camera: Option<String>,
    },
    /// List the latest alerts
    Alerts,
    /// List visitor sessions
    Sessions {
        #[arg(long)]
        user_id: Option<i64>,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
        /// login_at, -login_at, logout_at or -logout_at
        #[arg(long)]
        ordering: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// Show active/today/total counts instead
        #[arg(long)]
        stats: bool,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum PlateCommand {
    /// Read a plate from an image
    Detect { image: PathBuf },
    /// Assign a plate number to a user
    Assign {
        #[arg(long)]
        user_id: i64,
        number: String,
    },
    /// Check whether a plate number is registered
    Verify { number: String },
}

struct Api {
    base: String,
    http: Client,
}

impl Api {
    fn new(base: &str, timeout: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        send(self.http.get(self.url(path)).query(query))
    }

    fn post_file(&self, path: &str, query: &[(&str, String)], file: &Path) -> Result<Value> {
        let bytes =
            std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        tracing::debug!(file = %file.display(), bytes = bytes.len(), "uploading");
        send(
            self.http
                .post(self.url(path))
                .query(query)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        )
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        send(self.http.post(self.url(path)).json(body))
    }
}

fn send(request: RequestBuilder) -> Result<Value> {
    let response = request.send().context("failed to reach atriumd")?;
    let status = response.status();
    let text = response.text().context("failed to read response")?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    if !status.is_success() {
        bail!("{status}: {}", error_message(&body));
    }
    Ok(body)
}

fn error_message(body: &Value) -> String {
    match body.get("error").and_then(Value::as_str) {
        Some(msg) => msg.to_string(),
        None => body.to_string(),
    }
}

/// Query pairs for the optional session filters that are set.
fn session_query(
    user_id: Option<i64>,
    from: Option<String>,
    to: Option<String>,
    ordering: Option<String>,
    limit: Option<u32>,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(id) = user_id {
        query.push(("user_id", id.to_string()));
    }
    if let Some(from) = from {
        query.push(("from", from));
    }
    if let Some(to) = to {
        query.push(("to", to));
    }
    if let Some(ordering) = ordering {
        query.push(("ordering", ordering));
    }
    if let Some(limit) = limit {
        query.push(("limit", limit.to_string()));
    }
    query
}

/// Upload extension taken from the file name, without the dot.
fn extension_of(file: &Path) -> Option<String> {
    file.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn run(cli: Cli) -> Result<Value> {
    let api = Api::new(&cli.url, cli.timeout)?;

    match cli.command {
        Commands::Enroll {
            user_id,
            visitor,
            image,
        } => api.post_file(
            "/api/ai/face/enroll",
            &[("user_id", user_id.to_string()), ("visitor", visitor.to_string())],
            &image,
        ),
        Commands::Login { visitor, image } => {
            if visitor {
                api.post_file("/api/ai/visitor/login", &[], &image)
            } else {
                api.post_file("/api/ai/face/login", &[], &image)
            }
        }
        Commands::Logout { user_id } => {
            api.post_json("/api/ai/visitor/logout", &json!({ "user_id": user_id }))
        }
        Commands::Revoke { user_id, purge } => api.post_json(
            "/api/ai/face/revoke",
            &json!({ "user_id": user_id, "purge": purge }),
        ),
        Commands::Faces => api.get("/api/ai/face/debug", &[]),
        Commands::Plate { command } => match command {
            PlateCommand::Detect { image } => api.post_file("/api/ai/plates/detect", &[], &image),
            PlateCommand::Assign { user_id, number } => api.post_json(
                "/api/ai/plates/assign",
                &json!({ "user_id": user_id, "number": number }),
            ),
            PlateCommand::Verify { number } => {
                api.post_json("/api/ai/plates/verify", &json!({ "number": number }))
            }
        },
        Commands::Video { file, camera } => {
            let mut query = Vec::new();
            if let Some(camera) = camera {
                query.push(("camera_id", camera));
            }
            if let Some(ext) = extension_of(&file) {
                query.push(("ext", ext));
            }
            eprintln!("Uploading {} (this waits for analysis)...", file.display());
            api.post_file("/api/ai/video/upload-and-process", &query, &file)
        }
        Commands::Alerts => api.get("/api/ai/alerts", &[]),
        Commands::Sessions {
            user_id,
            from,
            to,
            ordering,
            limit,
            stats,
        } => {
            if stats {
                api.get("/api/ai/visitor/sessions/stats", &[])
            } else {
                let query = session_query(user_id, from, to, ordering, limit);
                api.get("/api/ai/visitor/sessions", &query)
            }
        }
        Commands::Status => api.get("/status", &[]),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let body = run(cli)?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enroll_visitor() {
        let cli = Cli::try_parse_from([
            "atrium", "enroll", "--user-id", "7", "--visitor", "face.jpg",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://127.0.0.1:8088");
        match cli.command {
            Commands::Enroll {
                user_id,
                visitor,
                image,
            } => {
                assert_eq!(user_id, 7);
                assert!(visitor);
                assert_eq!(image, PathBuf::from("face.jpg"));
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_parse_plate_assign_with_global_url() {
        let cli = Cli::try_parse_from([
            "atrium",
            "plate",
            "assign",
            "--user-id",
            "3",
            "2345XYZ",
            "--url",
            "http://gate:8088",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://gate:8088");
        assert!(matches!(
            cli.command,
            Commands::Plate {
                command: PlateCommand::Assign { user_id: 3, .. }
            }
        ));
    }

    #[test]
    fn test_parse_faces() {
        let cli = Cli::try_parse_from(["atrium", "faces", "--timeout", "10"]).unwrap();
        assert_eq!(cli.timeout, 10);
        assert!(matches!(cli.command, Commands::Faces));
    }

    #[test]
    fn test_session_query_skips_unset() {
        let query = session_query(Some(4), None, Some("2024-03-31".into()), None, Some(10));
        assert_eq!(
            query,
            vec![
                ("user_id", "4".to_string()),
                ("to", "2024-03-31".to_string()),
                ("limit", "10".to_string()),
            ]
        );
        assert!(session_query(None, None, None, None, None).is_empty());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("clip.MOV")), Some("mov".into()));
        assert_eq!(extension_of(Path::new("clip")), None);
    }

    #[test]
    fn test_error_message_prefers_error_field() {
        assert_eq!(
            error_message(&json!({ "ok": false, "error": "NOT_VISITOR" })),
            "NOT_VISITOR"
        );
        assert_eq!(error_message(&json!("bad gateway")), "\"bad gateway\"");
    }
}
