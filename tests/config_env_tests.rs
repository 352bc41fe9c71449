//! Settings loading, environment variables and startup validation.

use std::env;
use std::io::Write;
use std::sync::Arc;

use kafkaesque_consumer::broker::memory::MemoryBroker;
use kafkaesque_consumer::constants::CONFIG_PATH_ENV;
use kafkaesque_consumer::prelude::*;
use kafkaesque_consumer::telemetry::{LOG_FORMAT_ENV, LogFormat};
use serial_test::serial;

const SETTINGS: &str = r#"
[default_cluster]
brokers = ["localhost:9092"]

[[consumers]]
topic = "orders"
group_level = "Yoga "
delay_time = [30, 60]
retry_times = 2
concurrent_nums = 4

[[consumers]]
topic = "audit"

[group_levels]
default = ["svc"]
yoga = ["svc-yoga-a", "svc-yoga-b"]
"#;

/// Run `f` with `key` set to `value`, restoring the previous value after.
fn with_env<F: FnOnce()>(key: &str, value: Option<&str>, f: F) {
    let saved = env::var(key).ok();
    // SAFETY: every caller is `#[serial]`.
    match value {
        Some(v) => unsafe { env::set_var(key, v) },
        None => unsafe { env::remove_var(key) },
    }

    f();

    match saved {
        Some(v) => unsafe { env::set_var(key, v) },
        None => unsafe { env::remove_var(key) },
    }
}

fn write_settings(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp file");
    file.write_all(content.as_bytes()).expect("write settings");
    file
}

#[test]
fn test_load_toml_file() {
    let file = write_settings(".toml", SETTINGS);
    let settings = Settings::load(file.path()).unwrap();

    assert!(settings.validate().is_ok());
    let configs = settings.consumer_configs().unwrap();
    let mut groups: Vec<_> = configs
        .iter()
        .map(|c| (c.topic().to_string(), c.group_id().to_string()))
        .collect();
    groups.sort();
    assert_eq!(
        groups,
        vec![
            ("audit".to_string(), "svc".to_string()),
            ("orders".to_string(), "svc-yoga-a".to_string()),
            ("orders".to_string(), "svc-yoga-b".to_string()),
        ]
    );

    let orders = configs.iter().find(|c| c.topic() == "orders").unwrap();
    assert_eq!(orders.concurrency(), 4);
    assert_eq!(orders.retry_limit(), 2);
    assert_eq!(orders.delay_ladder().as_slice(), &[30, 60]);
}

#[test]
fn test_non_toml_file_is_rejected() {
    let file = write_settings(".yaml", "consumers: []");
    let err = Settings::load(file.path()).unwrap_err();
    assert_eq!(err, ConfigError::UnsupportedFormat("yaml".into()));
}

#[test]
fn test_missing_file_reports_path() {
    let err = Settings::load("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Read { ref path, .. } if path.contains("not/here")));
}

#[test]
#[serial]
fn test_from_env_reads_config_path() {
    let file = write_settings(".toml", SETTINGS);
    let path = file.path().to_str().unwrap().to_string();

    with_env(CONFIG_PATH_ENV, Some(&path), || {
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.consumers.len(), 2);
    });
}

#[test]
#[serial]
fn test_from_env_without_variable() {
    with_env(CONFIG_PATH_ENV, None, || {
        assert_eq!(
            Settings::from_env().unwrap_err(),
            ConfigError::MissingEnv(CONFIG_PATH_ENV)
        );
    });
}

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env(LOG_FORMAT_ENV, Some("JSON"), || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env(LOG_FORMAT_ENV, None, || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}

#[tokio::test]
async fn test_fatal_config_aborts_registration() {
    let settings = Settings::from_toml_str(
        r#"
[default_cluster]
brokers = ["localhost:9092"]

[[consumers]]
topic = "orders"
retry_times = 3

[group_levels]
default = ["svc"]
"#,
    )
    .unwrap();

    let broker = Arc::new(MemoryBroker::new());
    broker.create_topic("orders", 1);
    let handlers = HandlerRegistry::new().with("orders", handler_fn(|_, _| async { Ok(()) }));

    let err = register_consumers(&settings, &handlers, broker.clone(), broker.clone())
        .err()
        .expect("registration should fail");
    assert!(matches!(
        err,
        ConsumerError::Config(ConfigError::MissingDelayLadder { ref topic, retry_limit: 3 })
            if topic == "orders"
    ));

    tokio::task::yield_now().await;
    assert!(broker.joins().is_empty());
}

#[tokio::test]
async fn test_invalid_settings_are_reported_together() {
    let settings = Settings::from_toml_str(
        r#"
[[consumers]]
topic = ""

[[delay_topics]]
seconds = 0
topic = "delay_0s"
"#,
    )
    .unwrap();

    let broker = Arc::new(MemoryBroker::new());
    let err = register_consumers(&settings, &HandlerRegistry::new(), broker.clone(), broker.clone())
        .err()
        .expect("registration should fail");

    match err {
        ConsumerError::Config(ConfigError::Invalid(errors)) => {
            assert!(errors.len() >= 3, "unexpected errors: {errors:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(broker.joins().is_empty());
}

#[tokio::test]
async fn test_registration_joins_configured_cluster() {
    let settings = Settings::from_toml_str(
        r#"
[default_cluster]
brokers = ["fallback:9092"]

[[consumer_clusters]]
name = "default_consumer"
brokers = ["consumer-a:9092"]

[[consumers]]
topic = "orders"

[group_levels]
default = ["svc"]
"#,
    )
    .unwrap();

    let broker = Arc::new(MemoryBroker::new());
    broker.create_topic("orders", 1);
    let handlers = HandlerRegistry::new().with("orders", handler_fn(|_, _| async { Ok(()) }));

    let mut registry =
        register_consumers(&settings, &handlers, broker.clone(), broker.clone()).unwrap();
    assert_eq!(registry.names(), vec!["orders/svc"]);

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !broker.has_session("svc") {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let joins = broker.joins();
    assert_eq!(joins[0].brokers, vec!["consumer-a:9092"]);
    assert_eq!(joins[0].topics, vec!["orders"]);

    registry.shutdown(std::time::Duration::from_secs(1)).await;
}
