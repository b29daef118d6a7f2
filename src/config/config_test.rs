use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::Error;

fn cleanup_all_quorum_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("QUORUM__") || key == "CONFIG_PATH" {
            std::env::remove_var(&key);
        }
    }
}

fn three_peer_config(data_dir: &std::path::Path) -> QuorumNodeConfig {
    let mut config = QuorumNodeConfig::default();
    config.cluster.my_id = Some(2);
    config.cluster.data_dir = data_dir.to_path_buf();
    config.cluster.servers = (1..=3)
        .map(|id| QuorumServer {
            id,
            addr: format!("127.0.0.1:{}", 2887 + id).parse().unwrap(),
        })
        .collect();
    config
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = QuorumNodeConfig::default();

    assert_eq!(config.quorum.tick_time_ms, 2000);
    assert_eq!(config.quorum.init_limit, 10);
    assert_eq!(config.quorum.sync_limit, 5);
    assert_eq!(config.cluster.client_port, 2181);
    assert!(config.retry.election.unlimited());
    assert!(!config.monitoring.prometheus_enabled);
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_quorum_env_vars();
    with_vars(
        vec![
            ("QUORUM__QUORUM__TICK_TIME_MS", Some("50")),
            ("QUORUM__CLUSTER__CLIENT_PORT", Some("3181")),
        ],
        || {
            let config = QuorumNodeConfig::new().unwrap();

            assert_eq!(config.quorum.tick_time_ms, 50);
            assert_eq!(config.cluster.client_port, 3181);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_quorum_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("peer.toml");

    std::fs::write(
        &config_path,
        r#"
        [cluster]
        my_id = 3
        servers = [
            { id = 1, addr = "127.0.0.1:2888" },
            { id = 2, addr = "127.0.0.1:2889" },
            { id = 3, addr = "127.0.0.1:2890" },
        ]

        [quorum]
        init_limit = 4
        sync_limit = 2
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = QuorumNodeConfig::new().expect("success");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .expect("override should merge");

        assert_eq!(config.cluster.my_id, Some(3));
        assert_eq!(config.cluster.servers.len(), 3);
        assert_eq!(config.quorum.init_limit, 4);
        assert_eq!(config.quorum.sync_limit, 2);
        // untouched fields keep their defaults
        assert_eq!(config.quorum.tick_time_ms, 2000);
    });
}

#[test]
#[serial]
fn load_resolves_id_and_log_dir_before_any_peer_is_built() {
    cleanup_all_quorum_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("peer.toml");
    std::fs::write(
        &config_path,
        r#"
        [cluster]
        my_id = 2
        log_dir = "/tmp/quorum-logs"
        "#,
    )
    .unwrap();

    with_vars(vec![("QUORUM__QUORUM__SYNC_LIMIT", Some("7"))], || {
        let config = QuorumNodeConfig::load(config_path.to_str()).expect("load");
        assert_eq!(config.cluster.my_id().unwrap(), 2);
        assert_eq!(config.cluster.log_dir, std::path::PathBuf::from("/tmp/quorum-logs"));
        assert_eq!(config.quorum.sync_limit, 7);

        let without_file = QuorumNodeConfig::load(None).expect("load");
        assert_eq!(without_file.cluster.my_id, None);
        assert_eq!(without_file.quorum.sync_limit, 7);
    });
}

#[test]
fn validation_should_fail_when_own_id_is_not_a_member() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = three_peer_config(dir.path());
    config.cluster.my_id = Some(7);

    match config.validate() {
        Err(Error::Config(e)) => assert!(e.to_string().contains("not in the peer list")),
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn validation_should_fail_with_duplicate_peer_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = three_peer_config(dir.path());
    config.cluster.servers[2].id = 1;

    assert!(matches!(config.validate(), Err(Error::Config(_))));
}

#[test]
fn validation_requires_limits_for_multi_peer_ensembles() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = three_peer_config(dir.path());
    config.quorum.sync_limit = 0;
    assert!(config.validate().is_err());

    // a single peer runs without a sync window
    let mut single = three_peer_config(dir.path());
    single.cluster.servers.retain(|s| s.id == 2);
    single.quorum.init_limit = 0;
    single.quorum.sync_limit = 0;
    assert!(single.validate().is_ok());
}

#[test]
fn validation_rejects_unknown_election_algorithm() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = three_peer_config(dir.path());
    config.quorum.election_alg = 3;
    assert!(config.validate().is_err());
}

#[test]
fn my_id_falls_back_to_marker_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("myid"), "3\n").unwrap();
    let mut config = three_peer_config(dir.path());
    config.cluster.my_id = None;

    assert_eq!(config.cluster.my_id().unwrap(), 3);
    assert!(config.validate().is_ok());
}

#[test]
fn my_id_marker_file_must_be_numeric() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("myid"), "three\n").unwrap();
    let mut config = three_peer_config(dir.path());
    config.cluster.my_id = None;

    assert!(config.cluster.my_id().is_err());
}

#[test]
fn derived_timeouts_follow_ticks() {
    let mut quorum = QuorumConfig::default();
    quorum.tick_time_ms = 100;
    quorum.init_limit = 10;
    quorum.sync_limit = 5;

    assert_eq!(quorum.init_timeout(), std::time::Duration::from_millis(1000));
    assert_eq!(quorum.sync_timeout(), std::time::Duration::from_millis(500));
}

#[test]
fn backoff_delay_doubles_up_to_cap() {
    let policy = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 10,
        base_delay_ms: 100,
        max_delay_ms: 350,
    };
    assert_eq!(policy.delay_for(0).as_millis(), 100);
    assert_eq!(policy.delay_for(1).as_millis(), 200);
    assert_eq!(policy.delay_for(2).as_millis(), 350);
    assert_eq!(policy.delay_for(60).as_millis(), 350);
}
