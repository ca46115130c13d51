use crate::config::Environment;
use std::collections::HashSet;
use url::Url;

/// Origin/Referer allow-list; development mode admits everything
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    environment: Environment,
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new(environment: Environment, allowed: &[String]) -> Self {
        Self {
            environment,
            allowed: allowed
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// `origin` wins over `referer`; only scheme, host and port are compared
    pub fn allows(&self, origin: Option<&str>, referer: Option<&str>) -> bool {
        if self.environment.is_development() {
            return true;
        }

        let Some(candidate) = origin.or(referer).filter(|v| !v.is_empty()) else {
            return false;
        };
        let Ok(url) = Url::parse(candidate) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };

        let simple = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        self.allowed.contains(&simple)
    }
}
