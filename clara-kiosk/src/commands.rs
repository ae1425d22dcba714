//! Operator commands read from stdin, one per line.

use anyhow::{Context, Result, anyhow, bail};
use clara_link::{AppState, Intent};
use serde_json::Value;

pub const HELP: &str = "\
commands:
  wake                 wake the kiosk (shows language select)
  lang <name>          select a language (starts chat)
  start                conversation started
  say <text>           send a user message
  diary <text>         read diary text aloud
  mic                  toggle the microphone
  mic-start | mic-stop | mic-cancel
  menu <json-object>   menu selection, fields sent as-is
  json <value>         send any JSON value
  state <0-8>          set the local state
  retry                retry the connection now
  status               print the current state and phase
  help                 this text
  quit                 exit";

#[derive(Debug, Clone, PartialEq)]
pub enum KioskCommand {
    Send(Intent),
    Raw(Value),
    SetState(AppState),
    Retry,
    Status,
    Help,
    Quit,
}

impl KioskCommand {
    /// Parse one line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "wake" => Self::Send(Intent::Wake),
            "lang" => Self::Send(Intent::LanguageSelected {
                language: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "start" => Self::Send(Intent::ConversationStarted),
            "say" => Self::Send(Intent::UserMessage {
                text: required(word, rest)?,
            }),
            "diary" => Self::Send(Intent::DiaryTts {
                text: required(word, rest)?,
            }),
            "mic" => Self::Send(Intent::ToggleMic),
            "mic-start" => Self::Send(Intent::MicStart),
            "mic-stop" => Self::Send(Intent::MicStop),
            "mic-cancel" => Self::Send(Intent::MicCancel),
            "menu" => {
                let value: Value = serde_json::from_str(&required(word, rest)?)
                    .context("menu expects a JSON object")?;
                match value {
                    Value::Object(fields) => Self::Send(Intent::MenuSelect { fields }),
                    _ => bail!("menu expects a JSON object"),
                }
            }
            "json" => Self::Raw(serde_json::from_str(&required(word, rest)?).context("invalid JSON")?),
            "state" => {
                let code: u8 = rest
                    .parse()
                    .map_err(|_| anyhow!("state expects an integer 0-{}", AppState::MAX))?;
                let state = AppState::new(code)
                    .ok_or_else(|| anyhow!("state expects an integer 0-{}", AppState::MAX))?;
                Self::SetState(state)
            }
            "retry" => Self::Retry,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command {other:?}, try help"),
        };
        Ok(Some(command))
    }
}

fn required(word: &str, rest: &str) -> Result<String> {
    if rest.is_empty() {
        bail!("{word} needs an argument");
    }
    Ok(rest.to_string())
}

/// Screen shown straight away after a successful send, ahead of the
/// backend's own push.
pub fn optimistic_state(intent: &Intent) -> Option<AppState> {
    match intent {
        Intent::Wake => Some(AppState::LANGUAGE_SELECT),
        Intent::LanguageSelected { .. } => Some(AppState::CHAT),
        _ => None,
    }
}
