use ac_domain::config::Config;

#[test]
fn default_sandbox_is_disabled() {
    let config = Config::default();
    assert!(!config.sandbox.enabled);
}

#[test]
fn explicit_sandbox_enabled_parses() {
    let toml_str = r#"
[sandbox]
enabled = true
auto_allow_bash_if_sandboxed = true
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert!(config.sandbox.enabled);
    assert!(config.sandbox.auto_allow_bash_if_sandboxed);
}

#[test]
fn default_exec_timeout_is_120_seconds() {
    let config = Config::default();
    assert_eq!(config.tools.exec.timeout_sec, 120);
}
