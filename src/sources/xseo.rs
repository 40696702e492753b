use super::{extract_candidates, Source};
use crate::models::Candidate;

/// xseo.in free proxy page
pub struct Xseo;

impl Source for Xseo {
    fn name(&self) -> &'static str {
        "xseo"
    }

    fn start_urls(&self) -> &[&'static str] {
        &["http://xseo.in/freeproxy"]
    }

    fn referer(&self) -> &'static str {
        "http://xseo.in"
    }

    fn cron_spec(&self) -> &'static str {
        "@every 5m"
    }

    fn parse(&self, body: &str) -> Vec<Candidate> {
        extract_candidates(body, self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_html_table() {
        let body = r#"<tr><td><font>10.0.0.1:80</font></td></tr><tr><td>10.0.0.2:8888</td></tr>"#;
        let found = Xseo.parse(body);
        assert_eq!(
            found,
            vec![
                Candidate::new("10.0.0.1", "80", "xseo"),
                Candidate::new("10.0.0.2", "8888", "xseo"),
            ]
        );
    }
}
