//! Line-based console gateway (stdin/stdout).
//!
//! Every line is a message from a single local user. Approval prompts are
//! answered with `/approve <id>`, `/deny <id>` or `/trust <id>`; a file is
//! attached with `/upload <path> <message>`.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{GatewayCommand, GatewayEvent, IncomingMessage};
use crate::hitl::{ApprovalEvent, MessageRef, PromptFormat};
use crate::sandbox::Upload;

/// Largest file accepted by `/upload`.
const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// What a console line asks for.
#[derive(Debug, PartialEq)]
pub enum ConsoleInput {
    Approval(ApprovalEvent),
    Upload { path: String, text: String },
    Message(String),
}

/// Parses one line of console input. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/approve" | "/deny" | "/trust" if !rest.is_empty() => {
            Some(ConsoleInput::Approval(ApprovalEvent {
                request_id: rest.to_string(),
                action: command.trim_start_matches('/').to_string(),
            }))
        }
        "/upload" if !rest.is_empty() => {
            let (path, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Some(ConsoleInput::Upload {
                path: path.to_string(),
                text: text.trim().to_string(),
            })
        }
        _ => Some(ConsoleInput::Message(line.to_string())),
    }
}

/// Renders a command as console output. Rich prompts are refused so the
/// approval layer falls back to plain text.
pub fn render_command(cmd: GatewayCommand) -> Option<String> {
    match cmd {
        GatewayCommand::SendMessage { body, .. } => Some(format!("{body}\n")),
        GatewayCommand::PresentApproval {
            text,
            format,
            choices,
            reply,
            ..
        } => {
            if format == PromptFormat::Rich {
                let _ = reply.send(Err(anyhow::anyhow!("console cannot render rich text")));
                return None;
            }
            let mut out = format!("\n{text}\n");
            let mut message_id = String::new();
            for choice in &choices {
                if let Some(event) = ApprovalEvent::parse(&choice.callback_data) {
                    out.push_str(&format!(
                        "  {}: /{} {}\n",
                        choice.label, event.action, event.request_id
                    ));
                    message_id = event.request_id;
                }
            }
            let _ = reply.send(Ok(MessageRef(message_id)));
            Some(out)
        }
        GatewayCommand::UpdateMessage { message, body, .. } => {
            Some(format!("[{}] {body}\n", message.0))
        }
    }
}

async fn read_upload(path: &str) -> Result<Upload> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > MAX_UPLOAD_BYTES {
        anyhow::bail!("file too large ({} bytes, max {MAX_UPLOAD_BYTES})", meta.len());
    }
    let data = tokio::fs::read(path).await?;
    Ok(Upload::new(path, data))
}

/// Turns a parsed line into a gateway event for the console user.
pub async fn to_event(input: ConsoleInput, user_id: i64) -> Result<GatewayEvent> {
    let event = match input {
        ConsoleInput::Approval(event) => GatewayEvent::ApprovalCallback(event),
        ConsoleInput::Message(text) => GatewayEvent::Message(IncomingMessage {
            user_id,
            chat_id: user_id,
            text,
            upload: None,
        }),
        ConsoleInput::Upload { path, text } => {
            let upload = read_upload(&path).await?;
            let text = if text.is_empty() {
                format!("I uploaded {}.", upload.safe_name())
            } else {
                text
            };
            GatewayEvent::Message(IncomingMessage {
                user_id,
                chat_id: user_id,
                text,
                upload: Some(upload),
            })
        }
    };
    Ok(event)
}

/// Writes commands to `out` until the command channel closes.
pub async fn write_commands<W>(mut cmd_rx: mpsc::Receiver<GatewayCommand>, mut out: W) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = cmd_rx.recv().await {
        if let Some(text) = render_command(cmd) {
            out.write_all(text.as_bytes()).await?;
            out.flush().await?;
        }
    }
    Ok(out)
}

/// Starts the console gateway and returns the channel pair.
pub fn connect(user_id: i64) -> (mpsc::Receiver<GatewayEvent>, mpsc::Sender<GatewayCommand>) {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        if let Err(e) = write_commands(cmd_rx, tokio::io::stdout()).await {
            warn!("Console output failed: {e}");
        }
    });

    tokio::spawn(async move {
        let _ = event_tx.send(GatewayEvent::Connected).await;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Console input failed: {e}");
                    break;
                }
            };
            let Some(input) = parse_line(&line) else {
                continue;
            };
            match to_event(input, user_id).await {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Could not read upload: {e}"),
            }
        }
        info!("Console input closed");
    });

    (event_rx, cmd_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::ApprovalChoice;
    use tokio::sync::oneshot;

    #[test]
    fn test_parse_plain_message() {
        assert_eq!(
            parse_line("  what's the time?  "),
            Some(ConsoleInput::Message("what's the time?".into()))
        );
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn test_parse_approval_commands() {
        for action in ["approve", "deny", "trust"] {
            let parsed = parse_line(&format!("/{action} ab12cd34")).unwrap();
            assert_eq!(
                parsed,
                ConsoleInput::Approval(ApprovalEvent {
                    request_id: "ab12cd34".into(),
                    action: action.into(),
                })
            );
        }
    }

    #[test]
    fn test_approval_without_id_is_a_message() {
        assert_eq!(
            parse_line("/approve"),
            Some(ConsoleInput::Message("/approve".into()))
        );
    }

    #[test]
    fn test_parse_upload() {
        assert_eq!(
            parse_line("/upload data/sales.csv sum the second column"),
            Some(ConsoleInput::Upload {
                path: "data/sales.csv".into(),
                text: "sum the second column".into(),
            })
        );
    }

    #[test]
    fn test_slash_commands_pass_through() {
        assert_eq!(parse_line("/status"), Some(ConsoleInput::Message("/status".into())));
    }

    #[tokio::test]
    async fn test_upload_event_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let input = ConsoleInput::Upload {
            path: path.to_str().unwrap().to_string(),
            text: String::new(),
        };
        match to_event(input, 3).await.unwrap() {
            GatewayEvent::Message(msg) => {
                assert_eq!(msg.text, "I uploaded notes.txt.");
                let upload = msg.upload.unwrap();
                assert_eq!(upload.safe_name(), "notes.txt");
                assert_eq!(upload.data, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails() {
        let input = ConsoleInput::Upload {
            path: "/definitely/not/here.csv".into(),
            text: "x".into(),
        };
        assert!(to_event(input, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_rich_prompt_refused() {
        let (reply, response) = oneshot::channel();
        let rendered = render_command(GatewayCommand::PresentApproval {
            chat_id: 1,
            text: "*bold*".into(),
            format: PromptFormat::Rich,
            choices: vec![],
            reply,
        });
        assert!(rendered.is_none());
        assert!(response.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_plain_prompt_lists_commands() {
        let (reply, response) = oneshot::channel();
        let rendered = render_command(GatewayCommand::PresentApproval {
            chat_id: 1,
            text: "Approval required for: run_python".into(),
            format: PromptFormat::Plain,
            choices: vec![
                ApprovalChoice {
                    label: "Approve".into(),
                    callback_data: "approve:ab12cd34".into(),
                },
                ApprovalChoice {
                    label: "Deny".into(),
                    callback_data: "deny:ab12cd34".into(),
                },
            ],
            reply,
        })
        .unwrap();

        assert!(rendered.contains("Approve: /approve ab12cd34"));
        assert!(rendered.contains("Deny: /deny ab12cd34"));
        assert_eq!(response.await.unwrap().unwrap(), MessageRef("ab12cd34".into()));
    }

    #[tokio::test]
    async fn test_write_commands_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(GatewayCommand::SendMessage {
            chat_id: 1,
            body: "hi there".into(),
        })
        .await
        .unwrap();
        tx.send(GatewayCommand::UpdateMessage {
            chat_id: 1,
            message: MessageRef("ab12cd34".into()),
            body: "Approved: run_python".into(),
        })
        .await
        .unwrap();
        drop(tx);

        let out = write_commands(rx, Vec::new()).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, "hi there\n[ab12cd34] Approved: run_python\n");
    }
}
