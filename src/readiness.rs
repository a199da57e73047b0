//! Readiness detection against live service output.
//!
//! Each configured pattern compiles into a [`ReadinessMatcher`] that listens
//! to one stream (or both) and fires at most once. A match records the
//! pattern's capture groups and derives endpoint URLs and ports to watch.

use regex::{Regex, RegexBuilder};

use crate::output::{sanitize_text, StreamKind};
use crate::task::{EndpointCaptureGroup, ReadinessConfig, ReadinessPattern, StreamSelector};

/// Compiles a readiness pattern, applying its flags.
pub fn compile_pattern(pattern: &ReadinessPattern) -> Result<Regex, String> {
    let mut builder = RegexBuilder::new(&pattern.pattern);
    for flag in pattern.flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'U' => {
                builder.swap_greed(true);
            }
            // Global, unicode and sticky flags have no meaning for a single test.
            'g' | 'u' | 'y' => {}
            other => return Err(format!("unsupported regex flag '{}'", other)),
        }
    }
    builder.build().map_err(|err| err.to_string())
}

/// Builds the URL for a captured endpoint value.
///
/// With an empty default host the capture is taken to be a full URL already.
pub fn endpoint_url(default_host_url: &str, captured: &str) -> String {
    if default_host_url.is_empty() {
        captured.to_string()
    } else {
        format!("{}:{}", default_host_url, captured)
    }
}

/// Extracts a port from a bare number or from the `:port` part of a URL.
pub fn parse_port(captured: &str) -> Option<u16> {
    let captured = captured.trim();
    if let Ok(port) = captured.parse() {
        return Some(port);
    }
    let (_, tail) = captured.rsplit_once(':')?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// A compiled readiness pattern.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    pub name: String,
    pub stream: StreamSelector,
    pub matched: bool,
    regex: Regex,
    endpoints: Vec<EndpointCaptureGroup>,
}

/// Evidence produced when a matcher fires.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessMatch {
    pub name: String,
    /// Capture groups 1..N; groups that did not participate are empty.
    pub groups: Vec<String>,
    /// Endpoint name and resolved URL pairs.
    pub endpoints: Vec<(String, String)>,
    /// Ports flagged for release monitoring.
    pub ports: Vec<u16>,
}

/// The set of matchers for one service boot.
#[derive(Debug, Clone, Default)]
pub struct ReadinessTracker {
    matchers: Vec<ReadinessMatcher>,
}

impl ReadinessTracker {
    pub fn compile(config: &ReadinessConfig) -> Result<Self, String> {
        let matchers = config
            .patterns
            .iter()
            .enumerate()
            .map(|(index, pattern)| {
                Ok(ReadinessMatcher {
                    name: pattern.name.clone().unwrap_or_else(|| index.to_string()),
                    stream: pattern.stream,
                    matched: false,
                    regex: compile_pattern(pattern)?,
                    endpoints: pattern.endpoints.clone(),
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { matchers })
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn all_matched(&self) -> bool {
        self.matchers.iter().all(|m| m.matched)
    }

    pub fn matchers(&self) -> &[ReadinessMatcher] {
        &self.matchers
    }

    /// Tests every pending matcher that listens to `stream` against `text`.
    pub fn feed(&mut self, stream: StreamKind, text: &str) -> Vec<ReadinessMatch> {
        let text = sanitize_text(text, true);
        let mut found = Vec::new();
        for matcher in self.matchers.iter_mut() {
            if matcher.matched || !matcher.stream.accepts(stream) {
                continue;
            }
            let Some(captures) = matcher.regex.captures(&text) else {
                continue;
            };
            matcher.matched = true;
            let groups = (1..captures.len())
                .map(|i| {
                    captures
                        .get(i)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .collect();
            let mut endpoints = Vec::new();
            let mut ports: Vec<u16> = Vec::new();
            for endpoint in &matcher.endpoints {
                let Some(value) = captures.get(endpoint.capture_group_index) else {
                    continue;
                };
                let value = value.as_str();
                endpoints.push((
                    endpoint.endpoint_name.clone(),
                    endpoint_url(&endpoint.endpoint_default_host_url, value),
                ));
                if endpoint.monitor_port_release_upon_termination {
                    if let Some(port) = parse_port(value) {
                        if !ports.contains(&port) {
                            ports.push(port);
                        }
                    }
                }
            }
            found.push(ReadinessMatch {
                name: matcher.name.clone(),
                groups,
                endpoints,
                ports,
            });
        }
        found
    }
}
