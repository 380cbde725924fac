use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Scope, Target, TargetId};
use crate::utils::error::AppError;

static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^/?(\w+)(?:@\w+)?(?:\s+(.*))?$").expect("command regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(Target),
    Remove(TargetId),
    Pause(Scope),
    Resume(Scope),
    SetInterval(Duration, Scope),
    Status,
    ProxyStatus,
    Subscribe(Scope),
    Unsubscribe(Scope),
    Help,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', try /help")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    InvalidTarget(String),
}

impl From<CommandError> for AppError {
    fn from(err: CommandError) -> Self {
        AppError::Command(err.to_string())
    }
}

pub const HELP: &str = "\
/add <product> <location> [name] - start monitoring a product at a store
/remove <product> <location> - stop monitoring and forget it
/pause [all | <product> <location>] - pause polling
/resume [all | <product> <location>] - resume polling
/setinterval <seconds> [all | <product> <location>] - change how often to poll
/status - show every target
/proxystatus - show proxy route health
/subscribe [all | <product> <location>] - get alerts in this chat
/unsubscribe [all | <product> <location>] - stop alerts in this chat
/help - show this message";

impl Command {
    /// Parses `/name@bot args`. The slash and bot suffix are optional and the
    /// name is case-insensitive.
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CommandError::Empty);
        }
        let captures = COMMAND_RE
            .captures(input)
            .ok_or_else(|| CommandError::Unknown(input.to_string()))?;

        let name = captures[1].to_lowercase();
        let args: Vec<&str> = captures
            .get(2)
            .map(|m| m.as_str().split_whitespace().collect())
            .unwrap_or_default();

        match name.as_str() {
            "add" => match args.as_slice() {
                [product, location, name @ ..] => {
                    let display_name = (!name.is_empty()).then(|| name.join(" "));
                    let target = Target::new(*product, *location, display_name);
                    target
                        .validate()
                        .map_err(|e| CommandError::InvalidTarget(e.to_string()))?;
                    Ok(Command::Add(target))
                }
                _ => Err(CommandError::Usage("/add <product> <location> [name]")),
            },
            "remove" => match args.as_slice() {
                [product, location] => Ok(Command::Remove(target_id(product, location)?)),
                _ => Err(CommandError::Usage("/remove <product> <location>")),
            },
            "pause" => Ok(Command::Pause(scope(&args, "/pause [all | <product> <location>]")?)),
            "resume" => Ok(Command::Resume(scope(&args, "/resume [all | <product> <location>]")?)),
            "subscribe" => Ok(Command::Subscribe(scope(
                &args,
                "/subscribe [all | <product> <location>]",
            )?)),
            "unsubscribe" => Ok(Command::Unsubscribe(scope(
                &args,
                "/unsubscribe [all | <product> <location>]",
            )?)),
            "setinterval" | "setpollinginterval" => {
                const USAGE: &str = "/setinterval <seconds> [all | <product> <location>]";
                let (secs, rest) = args.split_first().ok_or(CommandError::Usage(USAGE))?;
                let secs: u64 = secs.parse().map_err(|_| CommandError::Usage(USAGE))?;
                if secs == 0 {
                    return Err(CommandError::Usage(USAGE));
                }
                Ok(Command::SetInterval(Duration::from_secs(secs), scope(rest, USAGE)?))
            }
            "status" => Ok(Command::Status),
            "proxystatus" => Ok(Command::ProxyStatus),
            "help" | "start" => Ok(Command::Help),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn target_id(product: &str, location: &str) -> Result<TargetId, CommandError> {
    let target = Target::new(product, location, None);
    target
        .validate()
        .map_err(|e| CommandError::InvalidTarget(e.to_string()))?;
    Ok(target.id())
}

// no argument means every target
fn scope(args: &[&str], usage: &'static str) -> Result<Scope, CommandError> {
    match args {
        [] => Ok(Scope::All),
        [all] if all.eq_ignore_ascii_case("all") => Ok(Scope::All),
        [product, location] => Ok(Scope::Target(target_id(product, location)?)),
        _ => Err(CommandError::Usage(usage)),
    }
}
