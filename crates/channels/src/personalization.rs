//! `{{variable}}` personalization against prospect directory records.

use std::collections::HashMap;

use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::types::{Prospect, Step};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Renders step templates for a prospect. A placeholder resolves to the
/// prospect's value, then the configured default; empty strings count as
/// missing.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    sender_name: String,
    defaults: HashMap<String, String>,
}

impl TemplateRenderer {
    pub fn new(sender_name: impl Into<String>, defaults: HashMap<String, String>) -> Self {
        Self {
            sender_name: sender_name.into(),
            defaults,
        }
    }

    pub fn render(&self, step: &Step, prospect: &Prospect) -> OutreachResult<RenderedMessage> {
        let variables = self.variables_for(prospect);
        let subject = step
            .subject
            .as_deref()
            .map(|s| self.render_str(s, &variables))
            .transpose()?;
        let body = self.render_str(&step.body_template, &variables)?;
        Ok(RenderedMessage { subject, body })
    }

    pub fn variables_for(&self, prospect: &Prospect) -> HashMap<String, String> {
        HashMap::from([
            ("first_name".to_string(), prospect.first_name.clone()),
            ("company_name".to_string(), prospect.company_name.clone()),
            ("industry".to_string(), prospect.industry.clone()),
            ("recent_news".to_string(), prospect.recent_news.clone()),
            ("sender_name".to_string(), self.sender_name.clone()),
        ])
    }

    /// Substitutes every `{{name}}` in `template`. An unterminated `{{` is
    /// kept verbatim.
    pub fn render_str(
        &self,
        template: &str,
        variables: &HashMap<String, String>,
    ) -> OutreachResult<String> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            output.push_str(&rest[..start]);
            let name = rest[start + 2..start + 2 + len].trim();
            output.push_str(self.resolve(name, variables)?);
            rest = &rest[start + 2 + len + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }

    fn resolve<'a>(
        &'a self,
        name: &str,
        variables: &'a HashMap<String, String>,
    ) -> OutreachResult<&'a str> {
        variables
            .get(name)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.defaults.get(name).filter(|v| !v.trim().is_empty()))
            .map(String::as_str)
            .ok_or_else(|| OutreachError::MissingVariable {
                variable: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::types::Channel;

    fn prospect() -> Prospect {
        Prospect {
            id: "p-1".into(),
            first_name: "Dana".into(),
            company_name: "Acme".into(),
            industry: "Logistics".into(),
            recent_news: String::new(),
            email: "dana@acme.io".into(),
            phone: None,
            social_handle: None,
        }
    }

    #[test]
    fn test_renders_subject_and_body() {
        let renderer = TemplateRenderer::new("Sam", HashMap::new());
        let step = Step::new(
            Channel::Email,
            "Hi {{first_name}}, how is {{ industry }} treating {{company_name}}? - {{sender_name}}",
        )
        .with_subject("Quick question about {{company_name}}");

        let rendered = renderer.render(&step, &prospect()).unwrap();
        assert_eq!(
            rendered.subject.as_deref(),
            Some("Quick question about Acme")
        );
        assert_eq!(
            rendered.body,
            "Hi Dana, how is Logistics treating Acme? - Sam"
        );
    }

    #[test]
    fn test_empty_value_without_default_is_missing() {
        let renderer = TemplateRenderer::new("Sam", HashMap::new());
        let step = Step::new(Channel::Email, "Saw {{recent_news}}");
        let err = renderer.render(&step, &prospect()).unwrap_err();
        assert!(matches!(
            err,
            OutreachError::MissingVariable { ref variable } if variable == "recent_news"
        ));
    }

    #[test]
    fn test_default_fills_gap() {
        let defaults = HashMap::from([(
            "recent_news".to_string(),
            "your recent growth".to_string(),
        )]);
        let renderer = TemplateRenderer::new("Sam", defaults);
        let step = Step::new(Channel::Sms, "Congrats on {{recent_news}}!");
        let rendered = renderer.render(&step, &prospect()).unwrap();
        assert_eq!(rendered.body, "Congrats on your recent growth!");
    }

    #[test]
    fn test_unknown_placeholder_is_missing() {
        let renderer = TemplateRenderer::new("Sam", HashMap::new());
        let result = renderer.render_str("Hello {{nickname}}", &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_unterminated_placeholder_kept_verbatim() {
        let renderer = TemplateRenderer::new("Sam", HashMap::new());
        let rendered = renderer
            .render_str("Hi {{first_name", &HashMap::new())
            .unwrap();
        assert_eq!(rendered, "Hi {{first_name");
    }
}
