use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::{ChatClient, ConnectionState};
use crate::config::{HousemateConfig, ReconnectPolicy};
use crate::db::Database;
use crate::models::{ConversationId, MessageDraft, UserId, UserSummary};
use crate::repository::ChatRepository;
use crate::ws::{ServerEvent, TempId};

/// One line typed at the `connect` prompt.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Join(ConversationId),
    Leave(ConversationId),
    Send { receiver_id: UserId, text: String },
    Read(ConversationId),
    Typing { conversation_id: ConversationId, on: bool },
    Quit,
}

const HELP: &str = "\
commands:
  join <conversationId>
  leave <conversationId>
  send <receiverId> <text>
  read <conversationId>
  typing <conversationId> on|off
  quit";

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let id = |raw: &str| -> Result<i64> {
        raw.parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .with_context(|| format!("'{}' is not a valid id", raw))
    };

    let command = match verb {
        "join" => Command::Join(id(rest)?),
        "leave" => Command::Leave(id(rest)?),
        "read" => Command::Read(id(rest)?),
        "send" => {
            let (receiver, text) = rest.split_once(' ').context("usage: send <receiverId> <text>")?;
            Command::Send {
                receiver_id: id(receiver)?,
                text: text.trim().to_string(),
            }
        }
        "typing" => {
            let (conversation, flag) = rest
                .split_once(' ')
                .context("usage: typing <conversationId> on|off")?;
            let on = match flag.trim() {
                "on" => true,
                "off" => false,
                other => bail!("expected on|off, got '{}'", other),
            };
            Command::Typing {
                conversation_id: id(conversation)?,
                on,
            }
        }
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

fn temp_label(temp_id: Option<&TempId>) -> String {
    match temp_id {
        Some(TempId::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

fn describe(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Connected(p) => format!("joined as user {}", p.user_id),
        ServerEvent::MessageSent(p) => format!(
            "sent #{} in conversation {} (tempId {})",
            p.message.message.id,
            p.message.message.conversation_id,
            temp_label(p.temp_id.as_ref())
        ),
        ServerEvent::NewMessage(view) => format!(
            "[conversation {}] {}: {}",
            view.message.conversation_id,
            view.sender.full_name,
            view.message
                .content
                .as_deref()
                .or(view.message.file_name.as_deref())
                .unwrap_or("")
        ),
        ServerEvent::MessageError(p) => format!(
            "send failed (tempId {}): {}",
            temp_label(p.temp_id.as_ref()),
            p.message
        ),
        ServerEvent::UserTyping(p) => format!(
            "user {} {} typing",
            p.user_id,
            if p.is_typing { "is" } else { "stopped" }
        ),
        ServerEvent::MessagesRead(p) => format!(
            "user {} read conversation {}",
            p.user_id, p.conversation_id
        ),
        ServerEvent::Error(p) => format!("error: {}", p.message),
    }
}

/// Interactive socket session: reads commands from stdin, prints server events.
pub async fn connect_command(url: &str, user_id: UserId, policy: ReconnectPolicy) -> Result<()> {
    let (client, mut events) = ChatClient::connect(url, user_id, policy);
    let mut state = client.state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut next_temp_id = 0u64;

    eprintln!("[housemate: connecting to {}]", url);
    eprintln!("{}", HELP);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => eprintln!("[housemate: connected]"),
                    ConnectionState::Reconnecting { attempt } => {
                        eprintln!("[housemate: connection lost, retry {}]", attempt)
                    }
                    ConnectionState::GaveUp => {
                        eprintln!("[housemate: server unreachable, giving up]");
                        break;
                    }
                    ConnectionState::Closed => break,
                    ConnectionState::Connecting => {}
                }
            }
            Some(event) = events.recv() => {
                println!("{}", describe(&event));
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{}\n{}", e, HELP);
                        continue;
                    }
                };
                let sent = match command {
                    Command::Join(id) => client.join_conversation(id).await,
                    Command::Leave(id) => client.leave_conversation(id).await,
                    Command::Read(id) => client.mark_read(id, user_id).await,
                    Command::Typing { conversation_id, on } => {
                        client.typing(conversation_id, user_id, on).await
                    }
                    Command::Send { receiver_id, text } => {
                        next_temp_id += 1;
                        let draft = MessageDraft {
                            sender_id: Some(user_id),
                            receiver_id: Some(receiver_id),
                            content: Some(text),
                            ..Default::default()
                        };
                        client.send_message(draft, format!("cli-{}", next_temp_id)).await
                    }
                    Command::Quit => break,
                };
                if let Err(e) = sent {
                    eprintln!("[housemate: {}]", e);
                }
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Insert or refresh a user profile, so the store will accept messages for it.
pub async fn user_add_command(
    config: &HousemateConfig,
    id: UserId,
    full_name: &str,
    profile_picture: Option<String>,
) -> Result<()> {
    if id <= 0 {
        bail!("user id must be a positive integer");
    }
    let db = Database::new(config).await?;
    let repository = ChatRepository::new(&db);
    repository
        .upsert_user_profile(&UserSummary {
            id,
            full_name: full_name.to_string(),
            profile_picture,
        })
        .await
        .context("Failed to save user profile")?;
    println!("Saved user {} ({})", id, full_name);
    Ok(())
}
