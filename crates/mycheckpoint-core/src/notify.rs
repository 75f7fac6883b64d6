//! Outbound notification delivery.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use chrono::DateTime;
use thiserror::Error;
use tracing::{debug, info};

use crate::alert::{Notice, NoticeKind};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no recipients configured")]
    NoRecipients,

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Plain-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

pub trait Notifier {
    fn send(&self, message: &Message) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &Message) -> Result<(), NotifyError> {
        info!(subject = %message.subject, "notification (not delivered)");
        debug!("{}", message.body);
        Ok(())
    }
}

/// Delivers through the local MTA: the message is piped into
/// `sendmail -t`, which reads recipients from the headers.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    command: PathBuf,
    from: String,
    to: Vec<String>,
}

impl SendmailNotifier {
    pub fn new(command: impl Into<PathBuf>, from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            command: command.into(),
            from: from.into(),
            to,
        }
    }

    /// RFC 822 text handed to sendmail.
    pub fn render(&self, message: &Message) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        out.push_str(&format!("Subject: {}\r\n", message.subject));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=UTF-8\r\n");
        out.push_str("\r\n");
        for line in message.body.lines() {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, message: &Message) -> Result<(), NotifyError> {
        if self.to.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let command = self.command.display().to_string();
        let spawn_error = |source: std::io::Error| NotifyError::Spawn {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.render(message).as_bytes())
                .map_err(spawn_error)?;
        }

        let output = child.wait_with_output().map_err(spawn_error)?;
        if !output.status.success() {
            return Err(NotifyError::Exit {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(to = %self.to.join(","), subject = %message.subject, "notification sent");
        Ok(())
    }
}

pub(crate) fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// One message for every notice of a tick.
pub fn alert_message(host: &str, notices: &[Notice]) -> Message {
    let firing = notices
        .iter()
        .filter(|n| n.kind == NoticeKind::Firing)
        .count();
    let resolved = notices.len() - firing;
    let worst = notices
        .iter()
        .filter(|n| n.kind == NoticeKind::Firing)
        .map(|n| n.severity)
        .max();

    let subject = match (worst, resolved) {
        (Some(severity), 0) => format!("mycheckpoint [{}] {}: {} alert(s)", host, severity, firing),
        (Some(severity), _) => format!(
            "mycheckpoint [{}] {}: {} alert(s), {} resolved",
            host, severity, firing, resolved
        ),
        (None, _) => format!("mycheckpoint [{}]: {} alert(s) resolved", host, resolved),
    };

    let mut body = String::new();
    for notice in notices {
        let status = match notice.kind {
            NoticeKind::Firing => "FIRING",
            NoticeKind::Resolved => "RESOLVED",
        };
        body.push_str(&format!(
            "[{}] {} #{}: {}\n    condition: {}\n    since: {}\n",
            notice.severity,
            status,
            notice.condition_id,
            notice.description,
            notice.condition,
            format_ts(notice.episode_start_ts),
        ));
        if notice.kind == NoticeKind::Resolved {
            body.push_str(&format!("    resolved: {}\n", format_ts(notice.timestamp)));
        }
    }
    Message { subject, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;

    fn notice(kind: NoticeKind, severity: Severity) -> Notice {
        Notice {
            kind,
            condition_id: 4,
            severity,
            description: "Replication lag".to_string(),
            condition: "seconds_behind_master > 60".to_string(),
            episode_start_ts: 0,
            timestamp: 600,
        }
    }

    #[test]
    fn test_alert_message_batches_notices() {
        let m = alert_message(
            "db1",
            &[
                notice(NoticeKind::Firing, Severity::Warning),
                notice(NoticeKind::Firing, Severity::Critical),
                notice(NoticeKind::Resolved, Severity::Info),
            ],
        );
        assert_eq!(m.subject, "mycheckpoint [db1] critical: 2 alert(s), 1 resolved");
        assert_eq!(m.body.matches("FIRING").count(), 2);
        assert!(m.body.contains("resolved: 1970-01-01 00:10:00 UTC"));
    }

    #[test]
    fn test_render_headers() {
        let n = SendmailNotifier::new("/usr/sbin/sendmail", "mon@example.com", vec![
            "dba@example.com".to_string(),
            "ops@example.com".to_string(),
        ]);
        let text = n.render(&Message {
            subject: "hello".to_string(),
            body: "line one\nline two".to_string(),
        });
        assert!(text.starts_with("From: mon@example.com\r\nTo: dba@example.com, ops@example.com\r\n"));
        assert!(text.contains("Subject: hello\r\n"));
        assert!(text.ends_with("\r\n\r\nline one\r\nline two\r\n"));
    }

    #[test]
    fn test_sendmail_without_recipients() {
        let n = SendmailNotifier::new("/usr/sbin/sendmail", "mon@example.com", Vec::new());
        let err = n
            .send(&Message {
                subject: String::new(),
                body: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, NotifyError::NoRecipients));
    }

    #[test]
    fn test_sendmail_missing_binary() {
        let n = SendmailNotifier::new("/nonexistent/sendmail", "a@b", vec!["c@d".to_string()]);
        let err = n
            .send(&Message {
                subject: "s".to_string(),
                body: "b".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, NotifyError::Spawn { .. }));
    }
}
