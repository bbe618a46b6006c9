//! Topic names and the per-run topic universe.
//!
//! Log topics are the well-known destinations audit events are mirrored to.
//! Workload topics are generated once per run from three fixed vocabularies
//! and joined with [`SEPARATOR`], e.g. `fleet/vehicle1/location`.

use std::collections::HashSet;

use rand::Rng;

// Audit log destinations
pub const TOPIC_CONNECTION_LOGS: &str = "connection/logs";
pub const TOPIC_DISCONNECTION_LOGS: &str = "disconnection/logs";

pub const SEPARATOR: &str = "/";

// Vocabularies (category / subcategory / attribute)
pub const CATEGORIES: &[&str] = &[
    "fleet",
    "breaking",
    "home",
    "office",
    "weather",
    "factory",
    "agriculture",
    "transport",
    "sports",
    "finance",
    "healthcare",
    "education",
];

pub const SUBCATEGORIES: &[&str] = &[
    "vehicle1",
    "news",
    "livingroom",
    "temperature",
    "alerts",
    "sensor",
    "bedroom",
    "kitchen",
    "security",
    "stocks",
    "fitness",
    "classroom",
    "machinery",
];

pub const ATTRIBUTES: &[&str] = &[
    "location",
    "updates",
    "humidity",
    "motion",
    "status",
    "battery",
    "speed",
    "forecast",
    "fire",
    "growth",
    "market",
    "exercise",
    "surveillance",
];

/// Fixed candidate set of topics for one run.
///
/// Order is generation order and duplicates are kept, so uniform picks over
/// the sequence weight repeated topics accordingly.
#[derive(Debug, Clone, Default)]
pub struct TopicUniverse {
    topics: Vec<String>,
    members: HashSet<String>,
}

impl TopicUniverse {
    /// Draw `count` topics, one segment from each vocabulary per topic.
    pub fn generate<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let topics = (0..count)
            .map(|_| {
                [
                    pick(CATEGORIES, rng),
                    pick(SUBCATEGORIES, rng),
                    pick(ATTRIBUTES, rng),
                ]
                .join(SEPARATOR)
            })
            .collect();
        Self::from_topics(topics)
    }

    pub fn from_topics(topics: Vec<String>) -> Self {
        let members = topics.iter().cloned().collect();
        Self { topics, members }
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.topics.get(index).map(String::as_str)
    }

    /// Whether inbound traffic on `topic` is of local interest.
    pub fn contains(&self, topic: &str) -> bool {
        self.members.contains(topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }
}

fn pick<R: Rng + ?Sized>(vocab: &[&'static str], rng: &mut R) -> &'static str {
    vocab[rng.random_range(0..vocab.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_topics_use_the_vocabularies() {
        let mut rng = StdRng::seed_from_u64(7);
        let universe = TopicUniverse::generate(64, &mut rng);
        assert_eq!(universe.len(), 64);
        for topic in universe.iter() {
            let parts: Vec<&str> = topic.split(SEPARATOR).collect();
            assert_eq!(parts.len(), 3, "unexpected topic shape: {topic}");
            assert!(CATEGORIES.contains(&parts[0]));
            assert!(SUBCATEGORIES.contains(&parts[1]));
            assert!(ATTRIBUTES.contains(&parts[2]));
            assert!(universe.contains(topic));
        }
    }

    #[test]
    fn same_seed_same_universe() {
        let a = TopicUniverse::generate(10, &mut StdRng::seed_from_u64(42));
        let b = TopicUniverse::generate(10, &mut StdRng::seed_from_u64(42));
        assert!(a.iter().eq(b.iter()));
    }

    #[test]
    fn duplicates_are_kept() {
        let universe = TopicUniverse::from_topics(vec![
            "home/kitchen/fire".to_string(),
            "home/kitchen/fire".to_string(),
        ]);
        assert_eq!(universe.len(), 2);
        assert_eq!(universe.get(1), Some("home/kitchen/fire"));
    }

    #[test]
    fn empty_universe_contains_nothing() {
        let universe = TopicUniverse::generate(0, &mut StdRng::seed_from_u64(1));
        assert!(universe.is_empty());
        assert!(!universe.contains(TOPIC_CONNECTION_LOGS));
        assert_eq!(universe.get(0), None);
    }
}
