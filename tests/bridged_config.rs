use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use capture_bridge::config::BridgeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "BRIDGE_CONFIG",
        "BRIDGE_SOURCE",
        "BRIDGE_STREAM_PORT",
        "BRIDGE_SNAPSHOT_PORT",
        "BRIDGE_SNAPSHOT_FPS",
        "BRIDGE_SNAPSHOT_QUALITY",
        "BRIDGE_DRAIN_POLL_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = BridgeConfig::load().expect("load config");

    assert_eq!(cfg.pipelines.len(), 1);
    let pipeline = &cfg.pipelines[0];
    assert_eq!(pipeline.source_id, "stub://camera0");
    assert_eq!(pipeline.geometry.to_string(), "1280x720@30");
    assert_eq!(pipeline.stream_port, 27183);
    assert_eq!(pipeline.snapshot_port, 27184);
    assert_eq!(pipeline.snapshot_max_fps, 5);
    assert_eq!(pipeline.snapshot_quality, 80);
    assert_eq!(cfg.tuning.drain_poll, Duration::from_millis(20));
    assert_eq!(cfg.tuning.accept_poll, Duration::from_millis(50));
    assert_eq!(cfg.health_log, Duration::from_secs(5));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        r#"{
            "pipelines": [{
                "source_id": "v4l2:///dev/video2",
                "width": 640,
                "height": 480,
                "fps": 15,
                "stream_port": 9000,
                "snapshot_port": 9001,
                "snapshot_max_fps": 2,
                "snapshot_quality": 60
            }],
            "tuning": {
                "drain_poll_ms": 25,
                "accept_poll_ms": 100,
                "health_log_secs": 30
            }
        }"#,
    );

    std::env::set_var("BRIDGE_CONFIG", file.path());
    std::env::set_var("BRIDGE_SNAPSHOT_QUALITY", "95");
    std::env::set_var("BRIDGE_DRAIN_POLL_MS", "5");

    let cfg = BridgeConfig::load().expect("load config");

    let pipeline = &cfg.pipelines[0];
    assert_eq!(pipeline.source_id, "v4l2:///dev/video2");
    assert_eq!(pipeline.geometry.width, 640);
    assert_eq!(pipeline.geometry.height, 480);
    assert_eq!(pipeline.geometry.fps, 15);
    assert_eq!(pipeline.stream_port, 9000);
    assert_eq!(pipeline.snapshot_port, 9001);
    assert_eq!(pipeline.snapshot_max_fps, 2);
    assert_eq!(pipeline.snapshot_quality, 95);
    assert_eq!(pipeline.tuning.drain_poll, Duration::from_millis(5));
    assert_eq!(pipeline.tuning.accept_poll, Duration::from_millis(100));
    assert_eq!(cfg.health_log, Duration::from_secs(30));

    clear_env();
}

#[test]
fn per_pipeline_overrides_are_ignored_for_multiple_pipelines() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        r#"{
            "pipelines": [
                { "source_id": "stub://a", "stream_port": 9100, "snapshot_port": 9101 },
                { "source_id": "stub://b", "stream_port": 9200, "snapshot_port": 9201 }
            ]
        }"#,
    );
    std::env::set_var("BRIDGE_CONFIG", file.path());
    std::env::set_var("BRIDGE_SOURCE", "stub://override");

    let cfg = BridgeConfig::load().expect("load config");
    let ids: Vec<&str> = cfg.pipelines.iter().map(|p| p.source_id.as_str()).collect();
    assert_eq!(ids, vec!["stub://a", "stub://b"]);

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{ "pipelines": [] }"#,
        r#"{ "pipelines": [{ "snapshot_quality": 0 }] }"#,
        r#"{ "pipelines": [{ "width": 0 }] }"#,
        r#"{ "pipelines": [{ "stream_port": 9000, "snapshot_port": 9000 }] }"#,
        r#"{ "pipelines": [
              { "source_id": "stub://a", "stream_port": 9100, "snapshot_port": 9101 },
              { "source_id": "stub://a", "stream_port": 9200, "snapshot_port": 9201 }
           ] }"#,
        r#"{ "pipelines": [
              { "source_id": "stub://a", "stream_port": 9100, "snapshot_port": 9101 },
              { "source_id": "stub://b", "stream_port": 9101, "snapshot_port": 9201 }
           ] }"#,
        r#"{ "tuning": { "drain_poll_ms": 0 } }"#,
        r#"{ "pipelines": "not a list" }"#,
    ];
    for json in cases {
        let file = config_file(json);
        assert!(
            BridgeConfig::load_from(Some(file.path())).is_err(),
            "accepted invalid config {}",
            json
        );
    }

    std::env::set_var("BRIDGE_STREAM_PORT", "not-a-port");
    assert!(BridgeConfig::load().is_err());

    clear_env();
}
