use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref HREF_RE: Regex = Regex::new(r#"(?i)(<a\b[^>]*?href=")([^"]*)(")"#).unwrap();
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingOptions {
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub click: bool,
}

impl TrackingOptions {
    pub fn enabled(&self) -> bool {
        self.open || self.click
    }
}

fn should_skip(url: &str, base_url: &str) -> bool {
    url.is_empty()
        || url.starts_with('#')
        || url.starts_with("mailto:")
        || url.starts_with("tel:")
        || url.starts_with(&format!("{}/t/", base_url))
}

/// Rewrites links through the click redirect and appends the open pixel.
/// With both options off the input passes through untouched.
pub fn inject_tracking(
    html: &str,
    token: &str,
    base_url: &str,
    options: TrackingOptions,
) -> String {
    if !options.enabled() {
        return html.to_string();
    }

    let mut result = if options.click {
        let mut link_index: usize = 0;
        HREF_RE
            .replace_all(html, |caps: &Captures| {
                let url = &caps[2];
                if should_skip(url, base_url) {
                    return caps[0].to_string();
                }

                let query = serde_urlencoded::to_string([("url", url)]).unwrap_or_default();
                let tracked = format!("{}/t/{}/c/{}?{}", base_url, token, link_index, query);
                link_index += 1;
                format!("{}{}{}", &caps[1], tracked, &caps[3])
            })
            .into_owned()
    } else {
        html.to_string()
    };

    if options.open {
        let pixel = format!(
            "<img src=\"{}/t/{}/open.gif\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none;\">",
            base_url, token
        );
        if let Some(pos) = result.rfind("</body>") {
            result.insert_str(pos, &pixel);
        } else {
            result.push_str(&pixel);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://mail.example.com";
    const TOKEN: &str = "tok123";

    fn opts(open: bool, click: bool) -> TrackingOptions {
        TrackingOptions { open, click }
    }

    #[test]
    fn disabled_tracking_is_identity() {
        let html = "<html><body><a href=\"https://example.com\">x</a></body></html>";
        assert_eq!(inject_tracking(html, TOKEN, BASE, opts(false, false)), html);
    }

    #[test]
    fn first_link_gets_index_zero() {
        let html = "<a href=\"https://example.com/page\">x</a>";
        let out = inject_tracking(html, TOKEN, BASE, opts(false, true));
        assert!(out.contains(&format!(
            "{}/t/{}/c/0?url=https%3A%2F%2Fexample.com%2Fpage",
            BASE, TOKEN
        )));
    }

    #[test]
    fn link_indices_increment_per_rewritten_link() {
        let html = concat!(
            "<a href=\"https://a.example.com\">a</a>",
            "<a href=\"mailto:someone@example.com\">m</a>",
            "<a href=\"https://b.example.com\">b</a>",
        );
        let out = inject_tracking(html, TOKEN, BASE, opts(false, true));
        assert!(out.contains("/c/0?url=https%3A%2F%2Fa.example.com"));
        assert!(out.contains("/c/1?url=https%3A%2F%2Fb.example.com"));
        assert!(out.contains("href=\"mailto:someone@example.com\""));
    }

    #[test]
    fn skips_tel_fragment_and_already_tracked() {
        let tracked = format!("{}/t/{}/c/0?url=x", BASE, TOKEN);
        let html = format!(
            "<a href=\"tel:+15551234\">t</a><a href=\"#section\">f</a><a href=\"{}\">done</a>",
            tracked
        );
        let out = inject_tracking(&html, TOKEN, BASE, opts(false, true));
        assert!(out.contains("href=\"tel:+15551234\""));
        assert!(out.contains("href=\"#section\""));
        // The already-tracked link is untouched, not double-wrapped.
        assert_eq!(out.matches("/c/0?url=").count(), 1);
    }

    #[test]
    fn open_pixel_lands_before_body_close() {
        let html = "<html><body><p>hi</p></body></html>";
        let out = inject_tracking(html, TOKEN, BASE, opts(true, false));
        let pixel = out.find("open.gif").unwrap();
        let close = out.find("</body>").unwrap();
        assert!(pixel < close);
        assert!(out.contains(&format!("{}/t/{}/open.gif", BASE, TOKEN)));
    }

    #[test]
    fn open_pixel_appends_without_body_tag() {
        let html = "<p>hi</p>";
        let out = inject_tracking(html, TOKEN, BASE, opts(true, false));
        assert!(out.ends_with(">"));
        assert!(out.contains("open.gif"));
    }

    #[test]
    fn click_tracking_composes_with_compiled_template() {
        use crate::templates::{compile, TemplateBlock};
        use std::collections::HashMap;

        let blocks = vec![TemplateBlock::Button {
            label: "Go".into(),
            url: "https://example.com/go".into(),
        }];
        let html = compile(&blocks, &HashMap::new(), BASE);

        let out = inject_tracking(&html, TOKEN, BASE, opts(true, true));
        assert!(out.contains(&format!("{}/t/{}/c/0?url=", BASE, TOKEN)));
        assert!(out.contains("open.gif"));
    }
}
