//! Routing keys and binding patterns.
//!
//! Routing keys are dot separated words (`measurement.Belgrade`). Binding
//! patterns use topic-exchange wildcards: `*` matches exactly one word and
//! `#` matches zero or more. On the wire every key lives under the exchange
//! name as an MQTT topic, one level per word.

pub const MEASUREMENT_PATTERN: &str = "measurement.*";
pub const HEARTBEAT_PATTERN: &str = "heartbeat.*";

pub fn measurement_key(city: &str) -> String {
    format!("measurement.{}", sanitize_word(city))
}

pub fn heartbeat_key(city: &str) -> String {
    format!("heartbeat.{}", sanitize_word(city))
}

/// Makes a value safe to use as a single routing-key word.
pub fn sanitize_word(word: &str) -> String {
    let trimmed = word.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed
        .chars()
        .map(|c| match c {
            '.' | '/' | '+' | '#' | '*' => '_',
            other => other,
        })
        .collect()
}

pub fn to_topic(exchange: &str, routing_key: &str) -> String {
    let mut topic = String::with_capacity(exchange.len() + routing_key.len() + 1);
    topic.push_str(exchange);
    for word in routing_key.split('.') {
        topic.push('/');
        topic.push_str(word);
    }
    topic
}

/// Inverse of [`to_topic`]. Returns `None` for topics outside the exchange.
pub fn from_topic(exchange: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(exchange)?.strip_prefix('/')?;
    Some(rest.replace('/', "."))
}

pub fn to_filter(exchange: &str, pattern: &str) -> String {
    let mut filter = String::from(exchange);
    for word in pattern.split('.') {
        filter.push('/');
        filter.push_str(match word {
            "*" => "+",
            other => other,
        });
    }
    filter
}

pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            matches_words(&pattern[1..], key) || (!key.is_empty() && matches_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => matches_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => matches_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_single_word_per_city() {
        assert_eq!(measurement_key("Belgrade"), "measurement.Belgrade");
        assert_eq!(heartbeat_key("St. Louis"), "heartbeat.St_ Louis");
        assert_eq!(measurement_key("a/b+c#"), "measurement.a_b_c_");
        assert_eq!(measurement_key("  "), "measurement.unknown");
    }

    #[test]
    fn test_topic_conversion() {
        assert_eq!(
            to_topic("watt-flow", "measurement.Novi Sad"),
            "watt-flow/measurement/Novi Sad"
        );
        assert_eq!(
            from_topic("watt-flow", "watt-flow/heartbeat/Nis").as_deref(),
            Some("heartbeat.Nis")
        );
        assert_eq!(from_topic("watt-flow", "other/heartbeat/Nis"), None);
        assert_eq!(to_filter("watt-flow", MEASUREMENT_PATTERN), "watt-flow/measurement/+");
        assert_eq!(to_filter("watt-flow", "#"), "watt-flow/#");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches(MEASUREMENT_PATTERN, "measurement.Belgrade"));
        assert!(!matches(MEASUREMENT_PATTERN, "heartbeat.Belgrade"));
        assert!(!matches(MEASUREMENT_PATTERN, "measurement"));
        assert!(!matches(MEASUREMENT_PATTERN, "measurement.Belgrade.extra"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("measurement.#", "measurement"));
        assert!(matches("measurement.#", "measurement.a.b"));
        assert!(matches("#.Belgrade", "heartbeat.Belgrade"));
    }
}
