use handlebars::Handlebars;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::error::{ConsoleError, Result};
use crate::notify::{MailTransport, VerificationEmail};

const VERIFICATION_TEMPLATE: &str = r#"<html>
<body style="font-family: sans-serif">
  <p>Hello {{to_name}},</p>
  <p>{{message}}</p>
  <table>
    <tr><td><b>Transaction ID</b></td><td>{{transaction_id}}</td></tr>
    <tr><td><b>Date</b></td><td>{{event_date}}</td></tr>
    <tr><td><b>Time</b></td><td>{{event_time}}</td></tr>
    <tr><td><b>Venue</b></td><td>{{event_venue}}</td></tr>
  </table>
  <p><img src="{{qr_code_url}}" alt="Entry QR code" width="250" height="250"></p>
</body>
</html>"#;

struct Smtp {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// SMTP delivery of verification emails
///
/// Without SMTP settings the mailer still constructs, but every send fails
/// with "Email configuration missing".
pub struct Mailer {
    smtp: Option<Smtp>,
    templates: Handlebars<'static>,
}

impl Mailer {
    /// Build the mailer
    ///
    /// # Arguments
    /// * `config` - SMTP relay settings, if any
    ///
    /// # Errors
    /// * Returns a `Config` error for an unusable relay host or From address
    pub fn new(config: Option<&SmtpConfig>) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates
            .register_template_string("verification", VERIFICATION_TEMPLATE)
            .map_err(|e| ConsoleError::Config(e.to_string()))?;

        let smtp = match config {
            None => {
                log::warn!("No SMTP settings; verification emails will not be sent");
                None
            }
            Some(cfg) => {
                let creds = Credentials::new(cfg.username.clone(), cfg.password.clone());
                let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                    .map_err(|e| ConsoleError::Config(format!("smtp host {}: {}", cfg.host, e)))?
                    .credentials(creds)
                    .port(cfg.port)
                    .build();
                let from = cfg
                    .from
                    .parse::<Mailbox>()
                    .map_err(|e| ConsoleError::Config(format!("smtp from '{}': {}", cfg.from, e)))?;
                Some(Smtp { transport, from })
            }
        };

        Ok(Mailer { smtp, templates })
    }

    pub fn render(&self, email: &VerificationEmail) -> Result<String> {
        self.templates
            .render("verification", email)
            .map_err(|e| ConsoleError::Mail(e.to_string()))
    }
}

impl MailTransport for Mailer {
    async fn send(&self, email: &VerificationEmail) -> Result<()> {
        let Some(smtp) = &self.smtp else {
            return Err(ConsoleError::Mail("Email configuration missing".to_string()));
        };

        let address = email
            .to_email
            .parse::<Address>()
            .map_err(|e| ConsoleError::Mail(format!("'{}': {}", email.to_email, e)))?;
        let message = Message::builder()
            .from(smtp.from.clone())
            .to(Mailbox::new(Some(email.to_name.clone()), address))
            .subject("Registration verified")
            .header(ContentType::TEXT_HTML)
            .body(self.render(email)?)?;

        smtp.transport.send(message).await?;
        Ok(())
    }
}
