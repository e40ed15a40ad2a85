use agent_rpc::AppConfig;
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_layers_file_and_environment() {
    let file = config_file(
        r#"
        [rpc]
        max_retries = 4

        [[rpc.endpoints]]
        name = "primary"
        url = "https://primary.example"
        priority = 0
        max_requests_per_second = 5

        [[rpc.endpoints]]
        name = "backup"
        url = "https://backup.example"
        priority = 1

        [transactions]
        confirmations = 2
        gas_buffer_percent = 30

        [logging]
        level = "agent_rpc=debug"
        json = true
        "#,
    );

    let config = AppConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.rpc.endpoints.len(), 2);
    assert_eq!(config.rpc.endpoints[0].name, "primary");
    assert_eq!(config.rpc.max_retries, 4);
    assert_eq!(config.transactions.confirmations, 2);
    assert_eq!(config.transactions.gas_buffer_percent, 30);
    assert_eq!(config.transactions.retries, 3);
    assert!(config.logging.json);

    std::env::set_var("AGENT_RPC__RPC__MAX_RETRIES", "6");
    let overridden = AppConfig::load(Some(file.path()));
    std::env::remove_var("AGENT_RPC__RPC__MAX_RETRIES");
    assert_eq!(overridden.unwrap().rpc.max_retries, 6);
}

#[test]
fn test_invalid_file_is_rejected() {
    let file = config_file(
        r#"
        [[rpc.endpoints]]
        name = "bad"
        url = "ftp://bad.example"
        "#,
    );
    let err = AppConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Invalid URL"));

    let file = config_file(
        r#"
        [[rpc.endpoints]]
        name = "ok"
        url = "https://ok.example"

        [transactions]
        confirmations = 0
        "#,
    );
    assert!(AppConfig::load(Some(file.path())).is_err());
}
