//! [Mailer]s delivering the HTML run report.
//!
//! [SmtpMailer] talks to an SMTP server directly, [SendmailMailer] hands the
//! message to the local mail transfer agent.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use super::{AdapterError, Mailer};
use crate::config::{EmailConfig, MailTransport, SmtpTls};
use crate::util::process;

/// Build the [Mailer] selected by `email`.
pub fn from_config(
    email: &EmailConfig,
    sendmail: &Path,
    timeout: Duration,
) -> Result<Box<dyn Mailer>, AdapterError> {
    let from = parse_mailbox(&email.sender)?;
    match &email.transport {
        MailTransport::Smtp {
            server,
            port,
            user,
            password,
            tls,
        } => {
            let credentials = user
                .clone()
                .map(|user| Credentials::new(user, password.clone().unwrap_or_default()));
            let mailer = SmtpMailer::new(from, server, *port, credentials, *tls, timeout)?;
            Ok(Box::new(mailer))
        }
        MailTransport::Sendmail => Ok(Box::new(SendmailMailer::new(
            from,
            sendmail.to_path_buf(),
            timeout,
        ))),
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AdapterError> {
    address
        .parse()
        .map_err(|e| AdapterError::Mail(format!("invalid address {address:?}: {e}")))
}

fn html_message(from: &Mailbox, to: &str, subject: &str, body: &str) -> Result<Message, AdapterError> {
    Message::builder()
        .from(from.clone())
        .to(parse_mailbox(to)?)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(body.to_string())
        .map_err(|e| AdapterError::Mail(e.to_string()))
}

/// Sends over SMTP, optionally encrypted and authenticated.
pub struct SmtpMailer {
    from: Mailbox,
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(
        from: Mailbox,
        server: &str,
        port: Option<u16>,
        credentials: Option<Credentials>,
        tls: SmtpTls,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let builder = match tls {
            SmtpTls::None => SmtpTransport::builder_dangerous(server),
            SmtpTls::Starttls => SmtpTransport::starttls_relay(server)
                .map_err(|e| AdapterError::Mail(e.to_string()))?,
            SmtpTls::Wrapper => {
                SmtpTransport::relay(server).map_err(|e| AdapterError::Mail(e.to_string()))?
            }
        };

        let mut builder = builder.timeout(Some(timeout));
        if let Some(port) = port {
            builder = builder.port(port);
        }
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        Ok(Self {
            from,
            transport: builder.build(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        let message = html_message(&self.from, to, subject, body)?;
        let response = self
            .transport
            .send(&message)
            .map_err(|e| AdapterError::Mail(e.to_string()))?;
        log::debug!(target: "adapter::mail", "SMTP server accepted report: {}", response.code());
        Ok(())
    }
}

/// Pipes the message into `sendmail -t -oi`.
pub struct SendmailMailer {
    from: Mailbox,
    sendmail: PathBuf,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(from: Mailbox, sendmail: PathBuf, timeout: Duration) -> Self {
        Self {
            from,
            sendmail,
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut sendmail = Command::new(&self.sendmail);
        // recipients from the headers, a lone dot doesn't end the message
        sendmail.arg("-t").arg("-oi");
        sendmail
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        let message = html_message(&self.from, to, subject, body)?.formatted();
        let mut input = message.as_slice();
        process::run_with_io(
            &mut self.command(),
            self.timeout,
            Some(&mut input),
            &mut std::io::sink(),
        )
    }
}
