use super::{extract_candidates, Source};
use crate::models::Candidate;

/// TheSpeedX/PROXY-List http list
pub struct SpeedX;

impl Source for SpeedX {
    fn name(&self) -> &'static str {
        "speedx"
    }

    fn start_urls(&self) -> &[&'static str] {
        &["https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt"]
    }

    fn referer(&self) -> &'static str {
        "https://github.com/"
    }

    fn cron_spec(&self) -> &'static str {
        "@every 10m"
    }

    fn parse(&self, body: &str) -> Vec<Candidate> {
        extract_candidates(body, self.name())
    }
}
