#[cfg(test)]
use super::*;

#[test]
fn test_read_config() {
    let config = r#"
      server:
        address: 0.0.0.0:8888
      backend:
        url: http://victorialogs:9428
      db: /var/lib/vsentry/vsentry.db
      cache: /var/lib/vsentry/cache
    "#;
    let config = VSentryConfig::from_yaml(config).unwrap();

    assert_eq!(config.server.address.port(), 8888);
    assert_eq!(config.backend.insert_url(), "http://victorialogs:9428/insert/jsonline");
    assert_eq!(
        config.backend.query_url(),
        "http://victorialogs:9428/select/logsql/query"
    );
    assert_eq!(config.db, std::path::PathBuf::from("/var/lib/vsentry/vsentry.db"));
}

#[test]
fn test_defaults() {
    let config = VSentryConfig::from_yaml("db: test.db").unwrap();
    assert_eq!(config.server.address.port(), 8080);
    assert_eq!(config.ingest.queue_capacity, 10_000);
    assert_eq!(config.backend.base(), "http://127.0.0.1:9428");
}

#[test]
fn test_rejects_zero_queue_capacity() {
    let config = r#"
      ingest:
        queue_capacity: 0
    "#;
    assert!(VSentryConfig::from_yaml(config).is_err());
}

#[test]
fn test_rejects_bad_backend_scheme() {
    let config = r#"
      backend:
        url: ftp://backend:21
    "#;
    assert!(VSentryConfig::from_yaml(config).is_err());
}
