//! Read-only aggregation of the time-bucketed stats.
//!
//! For every queue in the master set the observer sums the per-second rate
//! and size buckets over the last second, minute, and hour, reading from
//! `now - 2` downward because the two most recent seconds may not have been
//! flushed yet. Missing buckets count as zero; every figure is the bucket
//! sum divided by the window width.

use std::collections::BTreeMap;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;

use crate::config::RedisConfig;
use crate::error::Result;
use crate::keys;

const WINDOW_SECOND: i64 = 1;
const WINDOW_MINUTE: i64 = 60;
const WINDOW_HOUR: i64 = 3600;

pub struct Observer {
    conn: MultiplexedConnection,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverReport {
    #[serde(rename = "Stats")]
    pub stats: BTreeMap<String, QueueStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueStats {
    pub input_rate_second: i64,
    pub input_rate_minute: i64,
    pub input_rate_hour: i64,
    pub work_rate_second: i64,
    pub work_rate_minute: i64,
    pub work_rate_hour: i64,
    pub input_size_second: i64,
    pub input_size_minute: i64,
    pub input_size_hour: i64,
    pub fail_size_second: i64,
    pub fail_size_minute: i64,
    pub fail_size_hour: i64,
    pub consumer_stats: BTreeMap<String, ConsumerStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsumerStats {
    pub work_rate_second: i64,
    pub work_rate_minute: i64,
    pub work_rate_hour: i64,
}

impl Observer {
    pub async fn new(cfg: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Produce a fresh report over every known queue and consumer.
    pub async fn report(&mut self) -> Result<ObserverReport> {
        let queues: Vec<String> = self.conn.smembers(keys::master_set()).await?;
        let now = Utc::now().timestamp();
        let mut stats = BTreeMap::new();
        for queue in queues {
            let queue_stats = self.queue_stats(&queue, now).await?;
            stats.insert(queue, queue_stats);
        }
        Ok(ObserverReport { stats })
    }

    async fn queue_stats(&mut self, queue: &str, now: i64) -> Result<QueueStats> {
        let consumers: Vec<String> = self.conn.smembers(keys::workers(queue)).await?;

        let mut stats = QueueStats::default();
        for consumer in consumers {
            let base = keys::working_rate(queue, &consumer);
            let consumer_stats = ConsumerStats {
                work_rate_second: self.window_avg(&base, now, WINDOW_SECOND).await?,
                work_rate_minute: self.window_avg(&base, now, WINDOW_MINUTE).await?,
                work_rate_hour: self.window_avg(&base, now, WINDOW_HOUR).await?,
            };
            stats.work_rate_second += consumer_stats.work_rate_second;
            stats.work_rate_minute += consumer_stats.work_rate_minute;
            stats.work_rate_hour += consumer_stats.work_rate_hour;
            stats.consumer_stats.insert(consumer, consumer_stats);
        }

        let input_rate = keys::input_rate(queue);
        stats.input_rate_second = self.window_avg(&input_rate, now, WINDOW_SECOND).await?;
        stats.input_rate_minute = self.window_avg(&input_rate, now, WINDOW_MINUTE).await?;
        stats.input_rate_hour = self.window_avg(&input_rate, now, WINDOW_HOUR).await?;

        let input_size = keys::input_size(queue);
        stats.input_size_second = self.window_avg(&input_size, now, WINDOW_SECOND).await?;
        stats.input_size_minute = self.window_avg(&input_size, now, WINDOW_MINUTE).await?;
        stats.input_size_hour = self.window_avg(&input_size, now, WINDOW_HOUR).await?;

        let fail_size = keys::failed_size(queue);
        stats.fail_size_second = self.window_avg(&fail_size, now, WINDOW_SECOND).await?;
        stats.fail_size_minute = self.window_avg(&fail_size, now, WINDOW_MINUTE).await?;
        stats.fail_size_hour = self.window_avg(&fail_size, now, WINDOW_HOUR).await?;

        Ok(stats)
    }

    /// Sum the buckets of the window ending at `now - 2`, averaged over
    /// the window width.
    async fn window_avg(&mut self, base: &str, now: i64, window: i64) -> Result<i64> {
        let buckets = bucket_range(base, now, window);
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&buckets)
            .query_async(&mut self.conn)
            .await?;
        let sum: i64 = values.into_iter().flatten().sum();
        Ok(sum / window)
    }
}

fn bucket_range(base: &str, now: i64, window: i64) -> Vec<String> {
    (2..window + 2).map(|i| keys::bucket(base, now - i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_range_skips_two_most_recent_seconds() {
        let range = bucket_range("redismq::q::rate", 1000, 1);
        assert_eq!(range, vec!["redismq::q::rate::998".to_string()]);
    }

    #[test]
    fn test_bucket_range_window_width() {
        let range = bucket_range("redismq::q::rate", 1000, 60);
        assert_eq!(range.len(), 60);
        assert_eq!(range.first().unwrap(), "redismq::q::rate::998");
        assert_eq!(range.last().unwrap(), "redismq::q::rate::939");
    }

    #[test]
    fn test_report_json_shape() {
        let mut stats = BTreeMap::new();
        let mut queue_stats = QueueStats {
            input_rate_second: 5,
            ..QueueStats::default()
        };
        queue_stats.consumer_stats.insert(
            "c1".to_string(),
            ConsumerStats {
                work_rate_second: 3,
                ..ConsumerStats::default()
            },
        );
        stats.insert("orders".to_string(), queue_stats);
        let report = ObserverReport { stats };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["Stats"]["orders"]["InputRateSecond"], 5);
        assert_eq!(
            value["Stats"]["orders"]["ConsumerStats"]["c1"]["WorkRateSecond"],
            3
        );
        assert_eq!(value["Stats"]["orders"]["FailSizeHour"], 0);
    }
}
