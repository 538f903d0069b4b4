//! Parsing of the lines typed at the prompt.

use noor_core::types::SourceFilter;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Anything that is not a command is a question.
    Ask(String),
    NewChat,
    List,
    /// 1-based index into the listed conversations.
    Select(usize),
    /// 1-based index into the listed conversations.
    Delete(usize),
    Stop,
    Filter(SourceFilter),
    Quota,
    Help,
    Quit,
    /// Blank line.
    Empty,
    /// A malformed command, with the message to show.
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Ask(line.to_string());
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        match name {
            "new" => Command::NewChat,
            "list" | "ls" => Command::List,
            "select" => parse_index(arg).map_or_else(Command::Invalid, Command::Select),
            "delete" | "rm" => parse_index(arg).map_or_else(Command::Invalid, Command::Delete),
            "stop" => Command::Stop,
            "filter" => match arg.map(str::parse::<SourceFilter>) {
                Some(Ok(filter)) => Command::Filter(filter),
                Some(Err(e)) => Command::Invalid(e),
                None => Command::Invalid("usage: /filter <both|quran|hadith>".to_string()),
            },
            "quota" => Command::Quota,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            other => Command::Invalid(format!("unknown command: /{}", other)),
        }
    }
}

fn parse_index(arg: Option<&str>) -> Result<usize, String> {
    match arg.map(str::parse::<usize>) {
        Some(Ok(n)) if n > 0 => Ok(n),
        _ => Err("expected a conversation number from /list".to_string()),
    }
}

pub const HELP: &str = "\
Commands:
  /new                         start a new conversation
  /list                        list conversations
  /select <n>                  switch to conversation n
  /delete <n>                  delete conversation n
  /stop                        stop the answer being written
  /filter <both|quran|hadith>  choose the cited sources
  /quota                       show today's usage
  /quit                        leave
Anything else is sent as a question.";
