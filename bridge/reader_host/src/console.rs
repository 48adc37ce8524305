use std::io::{self, BufRead};

use log::{info, warn};
use reader_bridge_runtime::{ReaderSession, ReaderTheme, Renderer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Next,
    Prev,
    Goto(String),
    Theme,
    SetTheme(String),
    Flow,
    SetFlow(String),
    Open(String),
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let needs_arg = |name: &str| {
        if rest.is_empty() {
            Err(format!("{name} needs an argument"))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match verb {
        "next" | "n" => ConsoleCommand::Next,
        "prev" | "p" => ConsoleCommand::Prev,
        "goto" => ConsoleCommand::Goto(needs_arg("goto")?),
        "theme" => ConsoleCommand::Theme,
        "set-theme" => ConsoleCommand::SetTheme(needs_arg("set-theme")?),
        "flow" => ConsoleCommand::Flow,
        "set-flow" => ConsoleCommand::SetFlow(needs_arg("set-flow")?),
        "open" => ConsoleCommand::Open(needs_arg("open")?),
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command: {other}")),
    };

    Ok(Some(command))
}

/// Reads commands line by line until `quit` or EOF.
pub fn run<R: Renderer>(session: &ReaderSession<R>, input: impl BufRead) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };

        if command == ConsoleCommand::Quit {
            break;
        }

        if let Err(err) = execute(session, command) {
            warn!("command failed: {err}");
        }
    }

    Ok(())
}

fn execute<R: Renderer>(
    session: &ReaderSession<R>,
    command: ConsoleCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ConsoleCommand::Next => session.next()?,
        ConsoleCommand::Prev => session.prev()?,
        ConsoleCommand::Goto(locator) => session.goto(&locator)?,
        ConsoleCommand::Theme => session.get_theme(|theme| {
            let rendered = serde_json::to_string(&theme).unwrap_or_default();
            info!("theme: {rendered}");
        })?,
        ConsoleCommand::SetTheme(raw) => {
            let theme: ReaderTheme = serde_json::from_str(&raw)?;
            session.set_theme(&theme)?;
        }
        ConsoleCommand::Flow => session.get_flow(|flow| match flow {
            Some(flow) => info!("flow: {flow}"),
            None => info!("flow: (unset)"),
        })?,
        ConsoleCommand::SetFlow(flow) => session.set_flow(&flow)?,
        ConsoleCommand::Open(path) => session.open_book(path)?,
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
