use super::{extract_candidates, Source};
use crate::models::Candidate;

/// github.com/clarketm/proxy-list plain text list
pub struct Clarketm;

impl Source for Clarketm {
    fn name(&self) -> &'static str {
        "clarketm"
    }

    fn start_urls(&self) -> &[&'static str] {
        &["https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list.txt"]
    }

    fn referer(&self) -> &'static str {
        "http://github.com/"
    }

    fn cron_spec(&self) -> &'static str {
        "@every 5m"
    }

    fn parse(&self, body: &str) -> Vec<Candidate> {
        extract_candidates(body, self.name())
    }
}
