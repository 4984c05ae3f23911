//! Slash-command interpreter. Output is sent back verbatim and never stored.

use crate::whitelist::Whitelist;

const COMMAND_LIST: &str = "Non-admin cmd:\n    /help(/h)\n    /check-health(/ch)\nAdmin cmd:\n    /whitelist(/wl)";

const USAGE: &str = "How to talk to the bot:\n\n\
  - Start a new conversation:\n\
      - in a group: mention the bot in a message that is not a reply;\n\
      - in a private chat: just send a message.\n\n\
  - Continue a conversation: reply to one of the bot's messages (mention optional). \
Everything from that message back to the message that started the conversation is used as context.\n\n\n\
Given a conversation (q is a question, a is an answer):\n\
  q1 -> a1 -> q2 -> a2 -> q3 -> a3\n\n\
  - replying to a3 uses q1 -> a1 -> q2 -> a2 -> q3 -> a3 as context;\n\n\
  - replying to a2 uses q1 -> a1 -> q2 -> a2 as context.\n\n\
So you can:\n\
  1. keep long context when you need it;\n\
  2. drop context you no longer want.\n\n\n\
Commands:\n\n";

/// Run the command line `input` (text after the leading `/`) for `user_id`.
pub fn handle_command(whitelist: &Whitelist, user_id: i64, input: &str) -> String {
    let args: Vec<&str> = input.split(' ').collect();
    match args[0] {
        "" => COMMAND_LIST.to_string(),
        "h" | "help" => format!("{USAGE}{COMMAND_LIST}"),
        "ch" | "check-health" => "1".to_string(),
        "wl" | "whitelist" => whitelist_command(whitelist, user_id, &args),
        _ => "Unknown cmd".to_string(),
    }
}

fn whitelist_command(whitelist: &Whitelist, user_id: i64, args: &[&str]) -> String {
    if !whitelist.is_admin(user_id) {
        return format!("You({user_id}) are not administrator.");
    }
    let Some(&sub) = args.get(1) else {
        return format!("{}: wrong args", args[0]);
    };
    match sub {
        "show" => match whitelist.show() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "whitelist show failed");
                format!("{}: failed to check whitelist: {e}", args[0])
            }
        },
        "add" => {
            if args.len() < 4 {
                return format!("{}: wrong args", args[..2].join(" "));
            }
            let add: fn(&Whitelist, i64) -> anyhow::Result<()> = match args[2] {
                "user" => Whitelist::add_user,
                "group" => Whitelist::add_group,
                _ => return format!("{}: wrong args", args[..3].join(" ")),
            };
            let mut added = Vec::new();
            for raw in &args[3..] {
                let Ok(id) = raw.parse::<i64>() else {
                    continue;
                };
                match add(whitelist, id) {
                    Ok(()) => added.push(id.to_string()),
                    Err(e) => tracing::warn!(id, error = %e, "whitelist add failed"),
                }
            }
            tracing::info!(admin = user_id, kind = args[2], added = ?added, "whitelist extended");
            format!("Successfully added {}", added.join(", "))
        }
        other => format!("{}: unknown subcommand: {other}", args[0]),
    }
}
