//! Datastore key templates.
//!
//! These names are an external contract: independent producers, consumers,
//! and observers only interoperate if every process derives byte-identical
//! keys for the same queue and consumer.

/// Set holding the name of every queue ever created.
pub fn master_set() -> String {
    "redismq::queues".to_string()
}

/// List of packages awaiting delivery.
pub fn input(queue: &str) -> String {
    format!("redismq::{queue}")
}

/// List of packages explicitly rejected by a consumer.
pub fn failed(queue: &str) -> String {
    format!("{}::failed", input(queue))
}

/// Set of consumer names ever registered on a queue.
pub fn workers(queue: &str) -> String {
    format!("{}::workers", input(queue))
}

/// Per-consumer list of in-flight packages, most recently fetched leftmost.
pub fn working(queue: &str, consumer: &str) -> String {
    format!("{}::working::{consumer}", input(queue))
}

/// Short-TTL liveness key asserting a live process owns the consumer slot.
pub fn consumer_heartbeat(queue: &str, consumer: &str) -> String {
    format!("{}::heartbeat", working(queue, consumer))
}

/// Liveness key asserting a live process is the buffered writer for a queue.
pub fn buffered_heartbeat(queue: &str) -> String {
    format!("{}::buffered::heartbeat", input(queue))
}

pub fn input_rate(queue: &str) -> String {
    format!("{}::rate", input(queue))
}

pub fn working_rate(queue: &str, consumer: &str) -> String {
    format!("{}::rate", working(queue, consumer))
}

pub fn input_size(queue: &str) -> String {
    format!("{}::size", input(queue))
}

pub fn failed_size(queue: &str) -> String {
    format!("{}::size", failed(queue))
}

/// Per-second stat bucket under a rate or size base key.
pub fn bucket(base: &str, second: i64) -> String {
    format!("{base}::{second}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_templates() {
        assert_eq!(master_set(), "redismq::queues");
        assert_eq!(input("orders"), "redismq::orders");
        assert_eq!(failed("orders"), "redismq::orders::failed");
        assert_eq!(workers("orders"), "redismq::orders::workers");
    }

    #[test]
    fn test_consumer_key_templates() {
        assert_eq!(working("orders", "c1"), "redismq::orders::working::c1");
        assert_eq!(
            consumer_heartbeat("orders", "c1"),
            "redismq::orders::working::c1::heartbeat"
        );
        assert_eq!(
            buffered_heartbeat("orders"),
            "redismq::orders::buffered::heartbeat"
        );
    }

    #[test]
    fn test_stat_key_templates() {
        assert_eq!(input_rate("orders"), "redismq::orders::rate");
        assert_eq!(working_rate("orders", "c1"), "redismq::orders::working::c1::rate");
        assert_eq!(input_size("orders"), "redismq::orders::size");
        assert_eq!(failed_size("orders"), "redismq::orders::failed::size");
        assert_eq!(
            bucket(&input_rate("orders"), 1700000000),
            "redismq::orders::rate::1700000000"
        );
    }
}
