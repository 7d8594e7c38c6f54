//! Interactive commands read from stdin while a session runs.

use stompview_client::config::RequestSection;
use stompview_protocol::DataRequest;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Send another request, connecting first when no session is live.
    Submit(DataRequest),
    /// Start a new session with the given request.
    Connect(DataRequest),
    Disconnect,
    Status,
    /// Redraw the full table.
    Table,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  submit [TRADER|-] [OWNER,...]   send a request, connecting if needed
  connect [TRADER|-] [OWNER,...]  start a new session
  disconnect                      close the session
  status                          session state and counters
  table                           redraw the table
  help                            show this help
  quit                            disconnect and exit";

/// Parses one input line. Blank lines yield `Ok(None)`.
///
/// Request arguments fall back to the configured request; `-` clears the
/// trader.
pub fn parse(line: &str, defaults: &RequestSection) -> Result<Option<ShellCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match command.to_lowercase().as_str() {
        "submit" | "s" => ShellCommand::Submit(request_from_args(&args, defaults)?),
        "connect" | "c" => ShellCommand::Connect(request_from_args(&args, defaults)?),
        "disconnect" | "d" => ShellCommand::Disconnect,
        "status" => ShellCommand::Status,
        "table" | "t" => ShellCommand::Table,
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => return Err(format!("unknown command '{}' (try 'help')", other)),
    };
    Ok(Some(command))
}

fn request_from_args(args: &[&str], defaults: &RequestSection) -> Result<DataRequest, String> {
    let (trader, owners) = match args {
        [] => (defaults.trader.as_str(), defaults.book_owners.as_str()),
        [trader] => (*trader, defaults.book_owners.as_str()),
        [trader, owners] => (*trader, *owners),
        _ => return Err("expected at most TRADER and OWNER,...".to_string()),
    };
    let trader = if trader == "-" { "" } else { trader };
    Ok(DataRequest::from_input(trader, owners))
}
