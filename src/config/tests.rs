use super::types::*;
use super::SidecarConfig;
use std::collections::HashMap;
use std::path::Path;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_defaults_are_valid() {
    let cfg = SidecarConfig::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.balancer.policy, PolicyKind::LeastConn);
    assert_eq!(cfg.balancer.retries, 1);
    assert_eq!(cfg.admission.capacity, 0);
    assert_eq!(cfg.admission.window_secs, 30);
    assert_eq!(cfg.health.load_threshold, 2);
    assert_eq!(cfg.listen.inbound, "0.0.0.0:62081");
    assert_eq!(cfg.listen.outbound, "0.0.0.0:62082");
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = SidecarConfig::load(Path::new("/nonexistent/sidecar.toml")).unwrap();
    assert_eq!(cfg.app.url, "http://127.0.0.1:8080");
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        [listen]
        inbound = "127.0.0.1:7001"
        outbound = "127.0.0.1:7002"

        [balancer]
        policy = "MLeastConn"
        retries = 3
        reset_interval_ms = 250

        [admission]
        capacity = 10

        [health]
        load_threshold = 4
        rtt_threshold_ms = 12.5

        [discovery]
        service = "cart"
        endpoints = ["10.0.0.1", "10.0.0.2"]
    "#;
    let tmp = std::env::temp_dir().join("hermes_sidecar_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = SidecarConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.listen.inbound, "127.0.0.1:7001");
    assert_eq!(cfg.balancer.policy, PolicyKind::MLeastConn);
    assert_eq!(cfg.balancer.retries, 3);
    assert_eq!(cfg.balancer.reset_interval().as_millis(), 250);
    assert_eq!(cfg.admission.capacity, 10);
    assert_eq!(cfg.health.load_threshold, 4);
    assert!(cfg.health.rtt_demotion_enabled());
    assert_eq!(cfg.discovery.endpoints.len(), 2);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "balancer": { "policy": "Netflix", "retries": 2 },
        "discovery": { "watcher": "http://epwatcher:62000", "endpoints": null }
    }"#;
    let tmp = std::env::temp_dir().join("hermes_sidecar_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = SidecarConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.balancer.policy, PolicyKind::Netflix);
    assert_eq!(cfg.balancer.retries, 2);
    assert_eq!(
        cfg.discovery.watcher.as_deref(),
        Some("http://epwatcher:62000")
    );
    assert!(cfg.discovery.endpoints.is_empty());
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("hermes_sidecar_test_config.yaml");
    std::fs::write(&tmp, "balancer: {}").unwrap();
    let result = SidecarConfig::load(&tmp);
    std::fs::remove_file(&tmp).ok();
    assert!(result.is_err());
}

#[test]
fn test_env_overrides() {
    let mut cfg = SidecarConfig::default();
    cfg.apply_env_overrides(env(&[
        ("SIDECAR_LB_POLICY", "MLeastConn"),
        ("SIDECAR_RETRIES", "3"),
        ("SIDECAR_CAPACITY", "10"),
        ("SIDECAR_RESET_INTERVAL", "500ms"),
        ("SIDECAR_CAPACITY_WINDOW", "1m"),
        ("SIDECAR_LOAD_THRESHOLD", "5"),
        ("SIDECAR_RTT_THRESHOLD_MS", "20"),
        ("SIDECAR_SERVICE", "cart"),
        ("SIDECAR_POD_IPS", "10.0.0.1, 10.0.0.2,,"),
        ("SIDECAR_APP_URL", "http://127.0.0.1:5000"),
    ]))
    .unwrap();

    assert_eq!(cfg.balancer.policy, PolicyKind::MLeastConn);
    assert_eq!(cfg.balancer.retries, 3);
    assert_eq!(cfg.admission.capacity, 10);
    assert_eq!(cfg.balancer.reset_interval_ms, 500);
    assert_eq!(cfg.admission.window_secs, 60);
    assert_eq!(cfg.health.load_threshold, 5);
    assert_eq!(cfg.health.rtt_threshold_ms, 20.0);
    assert_eq!(cfg.discovery.service.as_deref(), Some("cart"));
    assert_eq!(cfg.discovery.endpoints, vec!["10.0.0.1", "10.0.0.2"]);
    assert_eq!(cfg.app.url, "http://127.0.0.1:5000");
    cfg.validate().unwrap();
}

#[test]
fn test_env_unknown_policy_fails() {
    let mut cfg = SidecarConfig::default();
    assert!(cfg
        .apply_env_overrides(env(&[("SIDECAR_LB_POLICY", "RoundRobin")]))
        .is_err());
}

#[test]
fn test_env_sub_second_window_rejected() {
    for window in ["500ms", "1500ms"] {
        let mut cfg = SidecarConfig::default();
        let err = cfg
            .apply_env_overrides(env(&[("SIDECAR_CAPACITY_WINDOW", window)]))
            .unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"), "{}", err);
    }

    let mut cfg = SidecarConfig::default();
    cfg.apply_env_overrides(env(&[("SIDECAR_CAPACITY_WINDOW", "2s")]))
        .unwrap();
    assert_eq!(cfg.admission.window_secs, 2);
}

#[test]
fn test_env_bad_number_fails() {
    let mut cfg = SidecarConfig::default();
    assert!(cfg
        .apply_env_overrides(env(&[("SIDECAR_RETRIES", "three")]))
        .is_err());
}

#[test]
fn test_validate_zero_retries_fails() {
    let mut cfg = SidecarConfig::default();
    cfg.balancer.retries = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_listen_fails() {
    let mut cfg = SidecarConfig::default();
    cfg.listen.outbound = "not-an-addr".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_app_url_fails() {
    let mut cfg = SidecarConfig::default();
    cfg.app.url = "https://127.0.0.1:8080".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_headroom_range() {
    let mut cfg = SidecarConfig::default();
    cfg.admission.credit_headroom = 0.0;
    assert!(cfg.validate().is_err());
    cfg.admission.credit_headroom = 1.5;
    assert!(cfg.validate().is_err());
    cfg.admission.credit_headroom = 1.0;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_endpoints_without_service_fails() {
    let mut cfg = SidecarConfig::default();
    cfg.discovery.endpoints = vec!["10.0.0.1".into()];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_policy_kind_parse() {
    assert_eq!("Random".parse::<PolicyKind>().unwrap(), PolicyKind::Random);
    assert_eq!(
        "LeastConn".parse::<PolicyKind>().unwrap(),
        PolicyKind::LeastConn
    );
    assert_eq!(
        "MLeastConn".parse::<PolicyKind>().unwrap(),
        PolicyKind::MLeastConn
    );
    assert_eq!("netflix".parse::<PolicyKind>().unwrap(), PolicyKind::Netflix);
    assert!("".parse::<PolicyKind>().is_err());
    assert_eq!(PolicyKind::MLeastConn.to_string(), "MLeastConn");
}
