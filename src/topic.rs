/// Topic carrying the end-of-stream signal. Its payload is always empty.
pub const SENTINEL_TOPIC: &str = "control/done";

const SENSOR_TOPIC_PREFIX: &str = "sensor/em/";

pub fn topic_for(sensor_id: i64) -> String {
    format!("{SENSOR_TOPIC_PREFIX}{sensor_id}")
}

/// Topics a consumer of sensors `1..=sensors` subscribes to, sentinel last.
pub fn consumer_topics(sensors: u32) -> Vec<String> {
    (1..=sensors as i64)
        .map(topic_for)
        .chain(std::iter::once(SENTINEL_TOPIC.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_for_sensor() {
        assert_eq!(topic_for(7), "sensor/em/7");
        assert_eq!(topic_for(120), "sensor/em/120");
    }

    #[test]
    fn test_sentinel_topic() {
        assert_eq!(SENTINEL_TOPIC, "control/done");
    }

    #[test]
    fn test_consumer_topics_cover_range_and_sentinel() {
        assert_eq!(
            consumer_topics(3),
            vec!["sensor/em/1", "sensor/em/2", "sensor/em/3", "control/done"]
        );
    }
}
