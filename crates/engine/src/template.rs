use chrono::{DateTime, Local, Timelike};
use minijinja::{context, Environment};
use tracing::debug;
use zapdesk_core::types::Contact;

pub fn greeting_for_hour(hour: u32) -> &'static str {
    match hour {
        0..=11 => "Bom dia",
        12..=17 => "Boa tarde",
        _ => "Boa noite",
    }
}

/// Render `{{ name }}`-style placeholders of an automated message.
pub fn format_body(body: &str, contact: &Contact) -> String {
    format_body_at(body, contact, Local::now())
}

pub fn format_body_at(body: &str, contact: &Contact, now: DateTime<Local>) -> String {
    if !body.contains("{{") && !body.contains("{%") {
        return body.to_string();
    }

    let env = Environment::new();
    let ctx = context! {
        name => contact.name.as_str(),
        firstName => contact.first_name(),
        greeting => greeting_for_hour(now.hour()),
        hour => now.format("%H:%M:%S").to_string(),
        date => now.format("%d/%m/%Y").to_string(),
        protocol => format!("{}{}", now.format("%Y%m%d%H%M%S"), contact.id),
    };
    match env.render_str(body, ctx) {
        Ok(rendered) => rendered,
        Err(e) => {
            debug!(error = %e, "Template render failed; sending raw body");
            body.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn contact() -> Contact {
        Contact {
            id: 7,
            tenant_id: 1,
            name: "Maria Souza".to_string(),
            number: "5511999990000".to_string(),
            preferred_id: None,
            lid: None,
            phone_number: None,
            profile_pic_url: None,
            is_group: false,
            ignore_messages: false,
            channel_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_placeholders_render() {
        let now = Local.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap();
        let out = format_body_at("{{ greeting }}, {{ firstName }}! ({{ date }})", &contact(), now);
        assert_eq!(out, "Bom dia, Maria! (04/03/2024)");
    }

    #[test]
    fn test_broken_template_falls_back_to_raw() {
        let body = "Olá {{ name ";
        assert_eq!(format_body(body, &contact()), body);
        assert_eq!(format_body("sem variáveis", &contact()), "sem variáveis");
    }

    #[test]
    fn test_greeting_boundaries() {
        assert_eq!(greeting_for_hour(11), "Bom dia");
        assert_eq!(greeting_for_hour(12), "Boa tarde");
        assert_eq!(greeting_for_hour(18), "Boa noite");
    }
}
