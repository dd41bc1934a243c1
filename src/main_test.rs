use super::*;
use std::collections::HashMap;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_config_defaults() {
    let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();

    assert_eq!(config.health_port, 8080);
    assert_eq!(config.watch_namespace, None);
    assert_eq!(config.in_place_poll_interval, Duration::from_secs(15));
}

#[test]
fn test_config_from_env_values() {
    let config = ControllerConfig::from_lookup(lookup(&[
        ("FLEET_HEALTH_PORT", "9090"),
        ("FLEET_WATCH_NAMESPACE", "fleet-system"),
        ("FLEET_IN_PLACE_POLL_SECONDS", "5"),
    ]))
    .unwrap();

    assert_eq!(config.health_port, 9090);
    assert_eq!(config.watch_namespace.as_deref(), Some("fleet-system"));
    assert_eq!(config.in_place_poll_interval, Duration::from_secs(5));
}

#[test]
fn test_config_empty_namespace_watches_all() {
    let config =
        ControllerConfig::from_lookup(lookup(&[("FLEET_WATCH_NAMESPACE", "")])).unwrap();
    assert_eq!(config.watch_namespace, None);
}

#[test]
fn test_config_rejects_invalid_values() {
    assert!(ControllerConfig::from_lookup(lookup(&[("FLEET_HEALTH_PORT", "http")])).is_err());
    assert!(
        ControllerConfig::from_lookup(lookup(&[("FLEET_IN_PLACE_POLL_SECONDS", "0")])).is_err()
    );
}
