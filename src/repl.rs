//! Line-oriented command console

use log::{debug, warn};
use roomcall::call::AgentSnapshot;
use roomcall::{CallEvent, CallHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Transcript analyzed when `analyze` is given no text
const SAMPLE_TRANSCRIPT: &str =
    "Finalizing the roadmap. We need to focus on signal reliability and AI integration.";

const HELP: &str = "\
commands:
  join <ROOM> <name>   enter a room (ends any live call)
  call                 ring the room
  accept | reject      answer an incoming call
  hangup               end the current call
  mic | video          toggle local tracks during a call
  analyze [text]       summarize a transcript and suggest talking points
  status               show the current state
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Join { room: String, name: String },
    Call,
    Accept,
    Reject,
    Hangup,
    Mic,
    Video,
    Analyze(String),
    Status,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_ascii_lowercase().as_str() {
        "join" => {
            let (room, name) = rest
                .split_once(char::is_whitespace)
                .map(|(room, name)| (room, name.trim()))
                .ok_or_else(|| "usage: join <ROOM> <name>".to_string())?;
            if name.is_empty() {
                return Err("usage: join <ROOM> <name>".to_string());
            }
            Input::Join {
                room: room.to_string(),
                name: name.to_string(),
            }
        }
        "call" => Input::Call,
        "accept" => Input::Accept,
        "reject" => Input::Reject,
        "hangup" | "end" => Input::Hangup,
        "mic" => Input::Mic,
        "video" => Input::Video,
        "analyze" if rest.is_empty() => Input::Analyze(SAMPLE_TRANSCRIPT.to_string()),
        "analyze" => Input::Analyze(rest.to_string()),
        "status" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command `{}` (try `help`)", other)),
    };
    Ok(Some(input))
}

/// Read commands from stdin until `quit` or end of input
pub async fn read_commands(handle: CallHandle) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    while let Some(line) = lines.next_line().await? {
        let input = match parse(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        debug!("Console input: {:?}", input);

        match input {
            Input::Join { room, name } => handle.join(&room, &name),
            Input::Call => handle.start_call(),
            Input::Accept => handle.accept(),
            Input::Reject => handle.reject(),
            Input::Hangup => handle.hang_up(),
            Input::Mic => handle.toggle_mic(),
            Input::Video => handle.toggle_video(),
            Input::Analyze(transcript) => handle.request_analysis(&transcript),
            Input::Status => println!("{}", describe(&handle.snapshot())),
            Input::Help => println!("{}", HELP),
            Input::Quit => break,
        }
    }
    Ok(())
}

pub fn describe(snapshot: &AgentSnapshot) -> String {
    let Some(user) = &snapshot.user else {
        return "not in a room".to_string();
    };
    let room = snapshot
        .room
        .as_ref()
        .map(|room| room.to_string())
        .unwrap_or_default();
    let call = match (&snapshot.status, &snapshot.counterparty) {
        (Some(status), Some(peer)) => format!("{} with {}", status, peer.display_name),
        (Some(status), None) => status.to_string(),
        (None, _) => "idle".to_string(),
    };
    format!(
        "{} in {} | call: {} | connection: {} | mic {} | video {}",
        user.display_name,
        room,
        call,
        snapshot.connection,
        on_off(snapshot.mic_enabled),
        on_off(snapshot.video_enabled)
    )
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

/// Print agent events until the agent goes away
pub async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Console missed {} call events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            CallEvent::Joined { room, user } => println!("* joined {} as {}", room, user.display_name),
            CallEvent::StatusChanged { status: Some(status), counterparty } => match counterparty {
                Some(peer) => println!("* call {} ({})", status, peer.display_name),
                None => println!("* call {}", status),
            },
            CallEvent::StatusChanged { status: None, .. } => println!("* idle"),
            CallEvent::IncomingCall { from } => {
                println!("* incoming call from {} (accept / reject)", from.display_name)
            }
            CallEvent::Ended { reason } => println!("* call ended: {}", reason),
            CallEvent::PeerPresent { user } => println!("* {} is in the room", user.display_name),
            CallEvent::RemoteMedia(media) => {
                println!("* receiving {} from stream {}", media.kind, media.stream_id)
            }
            CallEvent::ConnectionState(state) => println!("* connection {}", state),
            CallEvent::MediaToggled { kind, enabled } => println!("* {} {}", kind, on_off(enabled)),
            CallEvent::Analysis(report) => {
                match report.summary {
                    Some(summary) => {
                        println!("* summary: {}", summary.summary);
                        for item in summary.action_items {
                            println!("    - {}", item);
                        }
                    }
                    None => println!("* summary unavailable"),
                }
                println!("* suggestions: {}", report.suggestions.join(" | "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcall::signaling::User;

    #[test]
    fn join_takes_room_and_multi_word_name() {
        assert_eq!(
            parse("join stream-alpha  Ada Lovelace ").unwrap(),
            Some(Input::Join {
                room: "stream-alpha".to_string(),
                name: "Ada Lovelace".to_string(),
            })
        );
        assert!(parse("join ALPHA").is_err());
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse("  ").unwrap(), None);
        assert_eq!(parse("CALL").unwrap(), Some(Input::Call));
        assert_eq!(parse("end").unwrap(), Some(Input::Hangup));
        assert_eq!(parse("exit").unwrap(), Some(Input::Quit));
        assert!(parse("dance").is_err());
    }

    #[test]
    fn analyze_defaults_to_sample_transcript() {
        assert_eq!(
            parse("analyze").unwrap(),
            Some(Input::Analyze(SAMPLE_TRANSCRIPT.to_string()))
        );
        assert_eq!(
            parse("analyze ship it").unwrap(),
            Some(Input::Analyze("ship it".to_string()))
        );
    }

    #[test]
    fn describe_idle_and_joined() {
        let mut snapshot = AgentSnapshot::default();
        assert_eq!(describe(&snapshot), "not in a room");

        snapshot.user = Some(User::generate("Ada"));
        snapshot.room = Some(roomcall::RoomId::new("alpha"));
        let line = describe(&snapshot);
        assert!(line.starts_with("Ada in ALPHA | call: idle"));
        assert!(line.ends_with("mic on | video on"));
    }
}
