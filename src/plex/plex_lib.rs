//! Coordinates of the Plex Media Server a renderer's play queue lives on.
//!
//! Grounded on `original_source/plex/adapters.py::PlexLib`.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PlexLib {
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub token: String,
    pub machine_id: String,
}

impl PlexLib {
    /// Builds an absolute URL against this library, optionally appending
    /// `X-Plex-Token` as a query parameter (joined with `&` if `resource`
    /// already carries a query string, `?` otherwise).
    pub fn build_url(&self, resource: &str, with_token: bool) -> String {
        let mut url = format!("{}://{}:{}{}", self.protocol, self.address, self.port, resource);
        if with_token {
            let sep = if resource.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("X-Plex-Token=");
            url.push_str(&self.token);
        }
        url
    }

    /// Applies a subset of query parameters a Plex client sent along with a
    /// playback command (`protocol`, `address`, `port`, `token`,
    /// `machineIdentifier`), leaving any field it doesn't carry unchanged.
    pub fn update(&mut self, query: &HashMap<String, String>) {
        if let Some(v) = query.get("protocol") {
            self.protocol = v.clone();
        }
        if let Some(v) = query.get("address") {
            self.address = v.clone();
        }
        if let Some(v) = query.get("port").and_then(|p| p.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = query.get("token") {
            self.token = v.clone();
        }
        if let Some(v) = query.get("machineIdentifier") {
            self.machine_id = v.clone();
        }
    }

    pub fn timeline_url(&self) -> String {
        self.build_url("/:/timeline", false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn build_url_appends_token_with_question_mark() {
        let lib = PlexLib {
            protocol: "http".into(),
            address: "10.0.0.5".into(),
            port: 32400,
            token: "abc".into(),
            machine_id: String::new(),
        };
        assert_eq!(lib.build_url("/playQueues/7", true), "http://10.0.0.5:32400/playQueues/7?X-Plex-Token=abc");
    }

    #[test]
    fn build_url_appends_token_with_ampersand_when_query_present() {
        let lib = PlexLib {
            protocol: "http".into(),
            address: "10.0.0.5".into(),
            port: 32400,
            token: "abc".into(),
            machine_id: String::new(),
        };
        assert_eq!(
            lib.build_url("/playQueues/7?own=1", true),
            "http://10.0.0.5:32400/playQueues/7?own=1&X-Plex-Token=abc"
        );
    }

    #[test]
    fn build_url_without_token_leaves_resource_bare() {
        let lib = PlexLib::default();
        assert_eq!(lib.build_url("/:/timeline", false), "://:0/:/timeline");
    }

    #[test]
    fn update_only_overwrites_present_keys() {
        let mut lib = PlexLib { protocol: "http".into(), address: "1.2.3.4".into(), port: 1, token: "old".into(), machine_id: "m".into() };
        let mut q = HashMap::new();
        q.insert("token".to_string(), "new".to_string());
        lib.update(&q);
        assert_eq!(lib.token, "new");
        assert_eq!(lib.address, "1.2.3.4");
    }
}
