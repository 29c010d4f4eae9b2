//! Rendering of the run report and the decision whether to mail it.

use std::fmt::Write;

use chrono::{Local, NaiveDateTime};

use crate::backends::{AdapterError, Mailer};
use crate::config::EmailConfig;
use crate::run::{ActionKind, ActionOutcome, BackupRun, ItemOutcome, ItemStatus, RunStatus};

const MB: f64 = 1024.0 * 1024.0;

/// When the report is mailed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicy {
    #[serde(alias = "Always")]
    Always,
    #[default]
    #[serde(alias = "Never")]
    Never,
    /// Only if the run didn't fully succeed.
    #[serde(alias = "OnlyOnError", alias = "OnlyError")]
    OnlyOnError,
}

impl SendPolicy {
    pub fn should_send(self, status: RunStatus) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::OnlyOnError => status != RunStatus::Success,
        }
    }
}

/// Mail the report of `run` to the configured receiver if `policy` asks for it.
///
/// Returns [None] if no mail was due. The run must be finalized.
pub fn decide_and_send(
    run: &BackupRun,
    policy: SendPolicy,
    mailer: &dyn Mailer,
    email: &EmailConfig,
) -> Option<Result<(), AdapterError>> {
    let status = run.status()?;
    if !policy.should_send(status) {
        log::debug!(target: "notify", "Not sending report: run ended with {status}");
        return None;
    }

    let subject = subject(&email.subject, status);
    let body = render(run, Local::now().naive_local());
    log::info!(target: "notify", "Sending report to {}", email.receiver);
    Some(mailer.send(&email.receiver, &subject, &body))
}

pub fn subject(base: &str, status: RunStatus) -> String {
    let tag = match status {
        RunStatus::Success => "OK",
        RunStatus::PartialFailure => "PARTIAL",
        RunStatus::Failure => "ERROR",
    };
    format!("{base} ({tag})")
}

/// Render `run` as an HTML table, listing every action in pipeline order.
///
/// The notification itself isn't part of the report since it's sent after
/// rendering.
pub fn render(run: &BackupRun, finished_at: NaiveDateTime) -> String {
    let mut html = String::new();
    html.push_str(TABLE_OPEN);
    html.push_str(r#"<caption style="font-size: 1.2em; font-weight: bold; padding: 5px;">Backup report</caption>"#);
    header_row(&mut html, &format!("Start: {}", run.started_at.format("%d-%m-%Y %H:%M:%S")));

    for kind in ActionKind::ALL {
        if kind == ActionKind::SendEmail {
            continue;
        }
        match run.outcome(kind) {
            Some(outcome) => action_rows(&mut html, outcome),
            None => {
                action_row(&mut html, &kind.to_string());
                row(&mut html, "(SKIPPED) disabled");
            }
        }
    }

    let status = run
        .status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    header_row(
        &mut html,
        &format!("End: {} ({status})", finished_at.format("%d-%m-%Y %H:%M:%S")),
    );
    html.push_str("</table>");
    let _ = write!(
        html,
        r#"<p style="color: gray; font-size: 0.8em;">{} {}</p>"#,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    html
}

const TABLE_OPEN: &str = r#"<table style="font-family: Helvetica; line-height: 1.4; border-collapse: collapse; width: 100%;">"#;

fn header_row(html: &mut String, text: &str) {
    let _ = write!(
        html,
        r#"<tr style="color: #fff; background-color: #36304a;"><td style="padding: 10px;">{}</td></tr>"#,
        escape(text)
    );
}

fn action_row(html: &mut String, text: &str) {
    let _ = write!(
        html,
        r#"<tr style="color: gray; background-color: #f2f2f2;"><td style="padding: 10px;">{}</td></tr>"#,
        escape(text)
    );
}

fn row(html: &mut String, text: &str) {
    let _ = write!(
        html,
        r#"<tr style="color: #2b2b2b;"><td style="padding: 5px 10px;">{}</td></tr>"#,
        escape(text)
    );
}

fn action_rows(html: &mut String, outcome: &ActionOutcome) {
    action_row(
        html,
        &format!(
            "{}: {} ({})",
            outcome.kind,
            outcome.started_at.format("%H:%M:%S"),
            outcome.status()
        ),
    );
    if let Some(error) = &outcome.error {
        row(html, &format!("(ERROR) {error}"));
    } else if outcome.items.is_empty() {
        row(html, "(NOTHING TO DO)");
    }
    for item in &outcome.items {
        row(html, &item_line(item));
    }
}

fn item_line(item: &ItemOutcome) -> String {
    let mut info = item
        .bytes
        .map(|b| format!(" ({:.1} MB)", b as f64 / MB))
        .unwrap_or_default();
    if let Some(detail) = &item.detail {
        let _ = write!(info, " ({detail})");
    }
    match &item.status {
        ItemStatus::Done => format!("(OK) {}{info}", item.name),
        ItemStatus::Failed(reason) => format!("(ERROR) {}: {reason}", item.name),
        ItemStatus::TimedOut(after) => {
            format!("(TIMEOUT) {} after {}s", item.name, after.as_secs())
        }
        ItemStatus::SizeAlert { size_mb, max_mb } => {
            format!("(SIZE ALERT) {} ({size_mb:.0} MB of {max_mb} MB)", item.name)
        }
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '\n' => escaped.push_str("<br>"),
            c => escaped.push(c),
        }
    }
    escaped
}
