use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub registries: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            registries: vec!["gateway".into(), "directory".into()],
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("APP__REGISTRIES") {
        let registries = parse_registries(&v);
        if !registries.is_empty() {
            settings.registries = registries;
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = file_cfg.get("registries") {
        let registries = parse_registries(v);
        if !registries.is_empty() {
            settings.registries = registries;
        }
    }
}

/// Comma-separated registry names; blanks and repeats are dropped.
fn parse_registries(raw: &str) -> Vec<String> {
    let mut registries: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if !registries.iter().any(|existing| existing == name) {
            registries.push(name.to_string());
        }
    }
    registries
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
