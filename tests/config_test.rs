use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;
use telemetry_reporter::app::{Config, LogLevel};
use telemetry_reporter::buffer::AdmissionPolicy;
use tempfile::NamedTempFile;

const ENV_VARS: &[&str] = &[
    "REPORTER_CONFIG",
    "REPORTER_CONFIG_FILE",
    "REPORTER_SERVER_URLS",
    "REPORTER_SERVER_TIMEOUT_MS",
    "REPORTER_MAX_QUEUE_SIZE",
    "REPORTER_API_REQUEST_SIZE",
    "REPORTER_API_REQUEST_TIME_MS",
    "REPORTER_VERIFY_SERVER_CERT",
    "REPORTER_SECRET_TOKEN",
    "REPORTER_API_KEY",
    "REPORTER_REPORT_SYNC",
    "REPORTER_DROP_EVENTS_IF_QUEUE_FULL",
    "REPORTER_COMPRESS",
    "REPORTER_CLOSE_TIMEOUT_MS",
    "REPORTER_SERVICE_NAME",
    "REPORTER_SERVICE_VERSION",
    "LOG_LEVEL",
];

fn clean_env() {
    unsafe {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }
}

fn toml_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_from_env_reads_overrides() {
    clean_env();
    unsafe {
        env::set_var("REPORTER_SERVER_URLS", "http://a:8200, http://b:8200");
        env::set_var("REPORTER_MAX_QUEUE_SIZE", "100");
        env::set_var("REPORTER_DROP_EVENTS_IF_QUEUE_FULL", "true");
        env::set_var("REPORTER_API_REQUEST_TIME_MS", "2500");
        env::set_var("LOG_LEVEL", "DEBUG");
    }

    let config = Config::from_env().unwrap();
    clean_env();

    assert_eq!(config.server_urls, vec!["http://a:8200", "http://b:8200"]);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.api_request_time, Duration::from_millis(2500));

    let reporter = config.to_reporter_config().unwrap();
    assert_eq!(reporter.queue.capacity(), 128);
    assert_eq!(reporter.queue.policy, AdmissionPolicy::DropOnFull);
}

#[test]
#[serial]
fn test_invalid_env_value_is_reported() {
    clean_env();
    unsafe {
        env::set_var("REPORTER_MAX_QUEUE_SIZE", "lots");
    }
    let result = Config::from_env();
    clean_env();

    let message = result.unwrap_err().to_string();
    assert!(message.contains("REPORTER_MAX_QUEUE_SIZE"), "{message}");
}

#[test]
#[serial]
fn test_inline_toml_from_env() {
    clean_env();
    unsafe {
        env::set_var(
            "REPORTER_CONFIG",
            "server_urls = [\"https://apm.internal:8200\"]\nreport_sync = true\n",
        );
    }
    let config = Config::from_env().unwrap();
    clean_env();

    assert!(config.report_sync);
    assert_eq!(config.server_urls, vec!["https://apm.internal:8200"]);
}

#[test]
#[serial]
fn test_file_values_apply_unless_cli_overrides() {
    clean_env();
    let file = toml_file(
        r#"
        server_urls = ["https://apm.internal:8200"]
        service_name = "billing"
        max_queue_size = 64
        secret_token = "from-file"

        [paths]
        telemetry = "/intake/v2/telemetry"

        [backoff]
        max_error_exponent = 4
        "#,
    );

    let config = Config::from_args_and_env([
        "telemetry-reporter",
        "--config-file",
        file.path().to_str().unwrap(),
        "--max-queue-size",
        "1000",
    ])
    .unwrap();

    assert_eq!(config.service_name, "billing");
    assert_eq!(config.server_urls, vec!["https://apm.internal:8200"]);
    assert_eq!(config.max_queue_size, 1000);
    assert_eq!(config.secret_token.as_deref(), Some("from-file"));
    assert_eq!(config.paths.telemetry, "/intake/v2/telemetry");
    assert_eq!(config.paths.events, "/intake/v2/events");
    assert_eq!(config.backoff.max_error_exponent, 4);

    let reporter = config.to_reporter_config().unwrap();
    assert_eq!(reporter.queue.capacity(), 1024);
    assert_eq!(reporter.client.paths.telemetry, "/intake/v2/telemetry");
}

#[test]
#[serial]
fn test_from_file() {
    clean_env();
    let file = toml_file("close_timeout_ms = 1500\nlog_level = \"warn\"\n");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.close_timeout, Duration::from_millis(1500));
    assert_eq!(config.log_level, LogLevel::Warn);
    assert!(config.compress);
    assert!(config.verify_server_cert);
}

#[test]
#[serial]
fn test_validation_failures() {
    clean_env();
    let invalid = [
        "server_urls = []",
        "server_urls = [\"not a url\"]",
        "server_urls = [\"ftp://apm:21\"]",
        "max_queue_size = 0",
        "api_request_size = 0",
        "service_name = \"  \"",
        "[backoff]\njitter_ratio = 1.5",
        "[paths]\nevents = \"intake\"",
    ];
    for content in invalid {
        assert!(Config::from_toml_str(content).is_err(), "accepted: {content}");
    }
}

#[test]
#[serial]
fn test_missing_file_is_an_error() {
    clean_env();
    assert!(Config::from_file("/nonexistent/reporter.toml").is_err());
}
