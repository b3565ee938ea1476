use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_heading_level() -> u8 {
    2
}

/// Building blocks of a campaign body. Stored as a JSON array in the
/// campaign row and rendered per recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TemplateBlock {
    Heading {
        text: String,
        #[serde(default = "default_heading_level")]
        level: u8,
    },
    Text {
        text: String,
    },
    Button {
        label: String,
        url: String,
    },
    Image {
        src: String,
        #[serde(default)]
        alt: String,
    },
    Divider,
    Html {
        html: String,
    },
}

/// Replaces `{{key}}` placeholders with recipient variables. Placeholders
/// without a matching key stay as-is.
pub fn substitute_vars(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();

    for (key, value) in vars {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

fn resolve_url(url: &str, base_url: &str) -> String {
    if url.starts_with('/') {
        format!("{}{}", base_url, url)
    } else {
        url.to_string()
    }
}

/// Renders blocks to a full HTML document with per-recipient variables
/// substituted into every text field. Pure: same inputs, same output.
pub fn compile(
    blocks: &[TemplateBlock],
    vars: &HashMap<String, String>,
    base_url: &str,
) -> String {
    let mut body = String::new();

    for block in blocks {
        match block {
            TemplateBlock::Heading { text, level } => {
                let level = (*level).clamp(1, 6);
                body.push_str(&format!(
                    "<h{level}>{}</h{level}>\n",
                    substitute_vars(text, vars)
                ));
            }
            TemplateBlock::Text { text } => {
                body.push_str(&format!("<p>{}</p>\n", substitute_vars(text, vars)));
            }
            TemplateBlock::Button { label, url } => {
                let href = resolve_url(&substitute_vars(url, vars), base_url);
                body.push_str(&format!(
                    "<p><a href=\"{}\" style=\"display:inline-block;padding:10px 18px;background:#2563eb;color:#ffffff;text-decoration:none;border-radius:4px;\">{}</a></p>\n",
                    href,
                    substitute_vars(label, vars)
                ));
            }
            TemplateBlock::Image { src, alt } => {
                let src = resolve_url(&substitute_vars(src, vars), base_url);
                body.push_str(&format!(
                    "<img src=\"{}\" alt=\"{}\" style=\"max-width:100%;\">\n",
                    src,
                    substitute_vars(alt, vars)
                ));
            }
            TemplateBlock::Divider => {
                body.push_str("<hr>\n");
            }
            TemplateBlock::Html { html } => {
                body.push_str(&substitute_vars(html, vars));
                body.push('\n');
            }
        }
    }

    format!(
        "<html>\n<body style=\"font-family: Arial, sans-serif;\">\n{}</body>\n</html>",
        body
    )
}
