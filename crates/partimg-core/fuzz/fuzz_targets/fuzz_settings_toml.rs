//! Fuzz test for settings TOML parsing
//!
//! Tests that settings deserialization handles arbitrary TOML safely.

#![no_main]

use libfuzzer_sys::fuzz_target;
use partimg_core::{EngineSettings, ProgressSettings, Settings};

fuzz_target!(|data: &str| {
    let result: Result<Settings, _> = toml::from_str(data);

    if let Ok(settings) = result {
        let _ = toml::to_string(&settings);
        let _ = toml::to_string_pretty(&settings);
        let _ = settings.engine.to_config().validate();
        let _ = settings.progress.style.len();
    }

    let _: Result<EngineSettings, _> = toml::from_str(data);
    let _: Result<ProgressSettings, _> = toml::from_str(data);

    let wrapped = format!("[engine]\n{}", data);
    let _: Result<Settings, _> = toml::from_str(&wrapped);

    let wrapped = format!("[progress]\n{}", data);
    let _: Result<Settings, _> = toml::from_str(&wrapped);
});
