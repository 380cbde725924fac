//! Operator commands, independent of the chat or HTTP surface they arrive on.

pub mod command;
pub mod telegram;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info};

use crate::models::Scope;
use crate::monitor::MonitorPhase;
use crate::notifications::dispatcher::escape_html;
use crate::notifications::SubscriberRegistry;
use crate::supervisor::MonitorSupervisor;
use crate::utils::error::{AppError, Result};

pub use command::{Command, CommandError, HELP};
pub use telegram::TelegramCommandSource;

/// Who sent a command. `recipient` is where replies and alerts go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub recipient: String,
    pub name: Option<String>,
}

impl Requester {
    pub fn new(recipient: impl Into<String>, name: Option<String>) -> Self {
        Self {
            recipient: recipient.into(),
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// HTML-formatted.
    pub text: String,
    pub is_error: bool,
}

impl Reply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

pub struct ControlChannel {
    supervisor: Arc<MonitorSupervisor>,
    subscribers: Arc<SubscriberRegistry>,
}

impl ControlChannel {
    pub fn new(supervisor: Arc<MonitorSupervisor>, subscribers: Arc<SubscriberRegistry>) -> Self {
        Self {
            supervisor,
            subscribers,
        }
    }

    pub async fn handle(&self, requester: &Requester, text: &str) -> Reply {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => return Reply::error(format!("⚠️ {}", escape_html(&e.to_string()))),
        };
        info!(recipient = %requester.recipient, ?command, "Handling command");

        match self.execute(requester, command).await {
            Ok(text) => Reply::ok(text),
            Err(e) if e.is_user_error() => Reply::error(format!("⚠️ {}", escape_html(&user_message(&e)))),
            Err(e) => {
                error!(recipient = %requester.recipient, "Command failed: {}", e);
                Reply::error("❗ Something went wrong, check the logs.")
            }
        }
    }

    async fn execute(&self, requester: &Requester, command: Command) -> Result<String> {
        match command {
            Command::Add(target) => {
                let name = escape_html(&target.display_name);
                let id = target.id();
                if self.supervisor.add(target).await? {
                    Ok(format!("👀 Now monitoring <b>{}</b> (<code>{}</code>)", name, id))
                } else {
                    Ok(format!("Updated <b>{}</b> (<code>{}</code>)", name, id))
                }
            }
            Command::Remove(id) => {
                self.supervisor.remove(&id).await?;
                Ok(format!("Stopped monitoring <code>{}</code>", escape_html(&id.to_string())))
            }
            Command::Pause(scope) => {
                self.supervisor.pause(&scope).await?;
                Ok(format!("⏸ Paused {}", escape_html(&scope.to_string())))
            }
            Command::Resume(scope) => {
                self.supervisor.resume(&scope).await?;
                Ok(format!("▶️ Resumed {}", escape_html(&scope.to_string())))
            }
            Command::SetInterval(interval, scope) => {
                self.supervisor.set_interval(&scope, interval).await?;
                Ok(format!(
                    "⏱ Polling {} every {}s",
                    escape_html(&scope.to_string()),
                    interval.as_secs()
                ))
            }
            Command::Status => Ok(self.render_status().await),
            Command::ProxyStatus => Ok(self.render_proxy_status().await),
            Command::Subscribe(scope) => {
                if let Scope::Target(id) = &scope {
                    let known = self.supervisor.list().await.iter().any(|s| &s.id == id);
                    if !known {
                        return Err(AppError::not_found(format!("target {}", id)));
                    }
                }
                self.subscribers
                    .subscribe(&requester.recipient, requester.name.clone(), &scope)
                    .await?;
                Ok(format!("🔔 Subscribed to {}", escape_html(&scope.to_string())))
            }
            Command::Unsubscribe(scope) => {
                if self.subscribers.unsubscribe(&requester.recipient, &scope).await? {
                    Ok(format!("🔕 Unsubscribed from {}", escape_html(&scope.to_string())))
                } else {
                    Ok(format!("You were not subscribed to {}", escape_html(&scope.to_string())))
                }
            }
            Command::Help => Ok(escape_html(HELP)),
        }
    }

    async fn render_status(&self) -> String {
        let snapshots = self.supervisor.list().await;
        let policy = self.supervisor.global_policy();

        let mut out = String::new();
        if policy.paused {
            out.push_str("⏸ <b>Monitoring is paused</b>\n");
        }
        if policy.backoff_multiplier > 1 {
            let _ = writeln!(out, "🐢 Global backoff x{}", policy.backoff_multiplier);
        }
        if snapshots.is_empty() {
            out.push_str("No targets are being monitored.");
            return out;
        }

        for snapshot in snapshots {
            let status = &snapshot.status;
            let phase = if !snapshot.enabled {
                "paused"
            } else {
                match status.phase {
                    MonitorPhase::Stopped => "stopped",
                    MonitorPhase::Polling => "polling",
                    MonitorPhase::Backoff => "backing off",
                }
            };
            let _ = write!(
                out,
                "• <b>{}</b> <code>{}</code>: {} ({})",
                escape_html(&snapshot.display_name),
                escape_html(&snapshot.id.to_string()),
                status.state,
                phase
            );
            let _ = write!(out, ", every {:.0}s", snapshot.interval_secs);
            if let Some(checked) = status.last_checked {
                let ago = (Utc::now() - checked).num_seconds().max(0);
                let _ = write!(out, ", checked {}s ago", ago);
            }
            if let Some(err) = &status.last_error {
                let _ = write!(out, "\n   last error: {}", escape_html(err));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    async fn render_proxy_status(&self) -> String {
        let routes = self.supervisor.pool().snapshot().await;
        let mut out = String::from("<b>Routes</b>\n");
        for route in routes {
            let _ = write!(
                out,
                "• <code>{}</code> health {:.2}, {}/{} failed",
                escape_html(&route.id),
                route.health,
                route.total_failures,
                route.total_requests
            );
            if let Some(remaining) = route.cooldown_remaining_secs {
                let _ = write!(out, ", cooling down {:.0}s", remaining);
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

fn user_message(err: &AppError) -> String {
    match err {
        AppError::Command(msg) | AppError::Validation(msg) => msg.clone(),
        AppError::NotFound { resource } => format!("{} is not monitored", resource),
        other => other.to_string(),
    }
}
