//! Stock template renderer — pure per-kind subject and body generation.

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{RenderedEmail, TemplateRenderer};
use cadence_core::types::{Contact, EmailKind, Organization};

/// Built-in renderer for the four message kinds.
#[derive(Debug, Clone, Default)]
pub struct StockRenderer;

impl StockRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateRenderer for StockRenderer {
    fn render(
        &self,
        kind: EmailKind,
        contact: &Contact,
        organization: &Organization,
    ) -> Result<RenderedEmail> {
        let name = contact.display_name();
        let org = &organization.name;
        let (subject, body) = match kind {
            EmailKind::Birthday => (
                format!("Happy Birthday from {org}!"),
                format!(
                    "Dear {name},\n\n\
                     Your birthday is coming up, and with it a window to review your \
                     coverage options. If you would like to walk through what's \
                     available this year, we're here to help.\n\n\
                     Warm regards,\n{org}"
                ),
            ),
            EmailKind::EffectiveDate => (
                format!("Your policy anniversary — {org}"),
                format!(
                    "Dear {name},\n\n\
                     The anniversary of your policy's effective date is approaching. \
                     This is a good time to make sure your current plan still fits. \
                     Reply to this message or give us a call to review your options.\n\n\
                     Warm regards,\n{org}"
                ),
            ),
            EmailKind::Aep => (
                format!("Annual Enrollment Period is here — {org}"),
                format!(
                    "Dear {name},\n\n\
                     The Annual Enrollment Period is open. Plans change every year, \
                     and a short review now can prevent surprises later. Let us know \
                     if you'd like to compare your options.\n\n\
                     Warm regards,\n{org}"
                ),
            ),
            EmailKind::PostWindow => (
                format!("Your enrollment window has closed — {org}"),
                format!(
                    "Dear {name},\n\n\
                     Your recent enrollment window has ended, but you may still have \
                     options available. Reach out if you'd like to talk through what \
                     applies to your situation.\n\n\
                     Warm regards,\n{org}"
                ),
            ),
            EmailKind::All => {
                return Err(CadenceError::Template(
                    "no template for contact-level kind 'all'".into(),
                ))
            }
        };

        Ok(RenderedEmail {
            html_body: to_html(&subject, &body),
            text_body: body,
            subject,
        })
    }
}

fn to_html(subject: &str, body: &str) -> String {
    let paragraphs: String = body
        .split("\n\n")
        .map(|p| format!("  <p>{}</p>\n", p.replace('\n', "<br>")))
        .collect();
    format!(
        "<html>\n<head><title>{subject}</title></head>\n<body>\n{paragraphs}</body>\n</html>"
    )
}
