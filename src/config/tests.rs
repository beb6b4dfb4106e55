use super::*;

#[test]
fn defaults_match_documented_values() {
    let config = RuntimeConfig::default();
    assert_eq!(config.workers, 10);
    assert_eq!(config.cleanup_interval_seconds, 3600);
    assert_eq!(config.instance_timeout_seconds, 7200);
    assert_eq!(config.max_history, 100);
    assert_eq!(config.task_timeout_seconds, 300);
    assert_eq!(config.mq.backend, MqBackend::Memory);
    assert_eq!(config.mq.max_queue_size, 10_000);
    assert_eq!(config.mq.stream_queue_size, 128);
}

#[test]
fn validation_rejects_zero_workers() {
    let config = RuntimeConfig {
        workers: 0,
        ..RuntimeConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn validation_clamps_max_history_to_floor() {
    let config = RuntimeConfig {
        max_history: 0,
        ..RuntimeConfig::default()
    };
    let validated = config.validate().unwrap();
    assert_eq!(validated.max_history, 1);
}

#[test]
fn backend_parses_known_names() {
    assert_eq!("memory".parse::<MqBackend>().unwrap(), MqBackend::Memory);
    assert_eq!("redis".parse::<MqBackend>().unwrap(), MqBackend::Redis);
    assert_eq!("amqp".parse::<MqBackend>().unwrap(), MqBackend::Amqp);
    assert!("kafka".parse::<MqBackend>().is_err());
}
