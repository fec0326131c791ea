use llmgate::config::{GatewayConfig, StoreBackend};
use tempfile::TempDir;

fn test_config(store: StoreBackend) -> GatewayConfig {
    GatewayConfig {
        listen: "127.0.0.1:0".to_string(),
        store,
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn sqlite_file_created_for_configured_dsn() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("data").join("llmgate.db");
    assert!(!db_path.exists());

    let config = test_config(StoreBackend::Sqlite(format!(
        "sqlite://{}",
        db_path.display()
    )));
    let _state = llmgate::app::load_state_with_config(config)
        .await
        .expect("load state");

    assert!(db_path.exists());
}

#[tokio::test]
async fn sqlite_memory_dsn_starts_without_files() {
    let config = test_config(StoreBackend::Sqlite("sqlite::memory:".to_string()));
    let _state = llmgate::app::load_state_with_config(config)
        .await
        .expect("load state");
}

#[tokio::test]
async fn session_mode_without_verifier_settings_fails_to_start() {
    let config = GatewayConfig {
        auth_mode: llmgate::config::AuthMode::Session,
        ..test_config(StoreBackend::Memory)
    };
    let err = match llmgate::app::load_state_with_config(config).await {
        Ok(_) => panic!("session mode should need a verifier"),
        Err(err) => err,
    };
    assert_eq!(err.code, "session_config_invalid");
}
