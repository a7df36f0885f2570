// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use aperture_common::settings::{BackendMode, GemSettings};
use ini::{Ini, Properties};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("[{section}] {key} = {value:?}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("aperture {start:#X}+{size:#X} overflows the address space")]
    ApertureOverflow { start: u64, size: u64 },
}

/// Load settings from `path`, falling back to defaults (with a warning) when
/// the file is missing or unparsable. Individual bad values keep their
/// default.
pub fn load_config(path: Option<&Path>) -> GemSettings {
    let Some(path) = path else {
        info!("No config file given, using defaults");
        return GemSettings::default();
    };
    match load_from_file(path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{e}; using defaults");
            GemSettings::default()
        }
    }
}

pub fn load_from_file(path: &Path) -> Result<GemSettings, SettingsError> {
    if !path.exists() {
        return Err(SettingsError::NotFound(path.to_path_buf()));
    }
    info!("Loading config from: {}", path.display());
    let conf = Ini::load_from_file(path).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(settings_from_ini(&conf))
}

pub fn settings_from_ini(conf: &Ini) -> GemSettings {
    let mut settings = GemSettings::default();

    // [Aperture]
    if let Some(section) = conf.section(Some("Aperture")) {
        let s = Section::new("Aperture", section);
        s.apply("start", &mut settings.aperture_start, parse_address);
        s.apply("size", &mut settings.aperture_size, parse_address);
        s.apply("max_eviction_attempts", &mut settings.max_eviction_attempts, parse_number);
        if let Some(limit) = s.value("pinned_page_limit", parse_number::<usize>) {
            settings.pinned_page_limit = (limit != 0).then_some(limit);
        }
    }

    // [Fence]
    if let Some(section) = conf.section(Some("Fence")) {
        let s = Section::new("Fence", section);
        s.apply("poll_interval_ms", &mut settings.poll_interval, parse_millis);
        s.apply("retire_interval_ms", &mut settings.retire_interval, parse_millis);
        s.apply("idle_timeout_ms", &mut settings.idle_timeout, parse_millis);
        s.apply("idle_poll_quantum_ms", &mut settings.idle_poll_quantum, parse_millis);
        s.apply("background_retire", &mut settings.background_retire, parse_bool);
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        let s = Section::new("Debugging", section);
        s.apply("verify_lists", &mut settings.verify_lists, parse_bool);
        s.apply(
            "sampler_always_flushed",
            &mut settings.sampler_always_flushed,
            parse_bool,
        );
    }

    // [Backend]
    if let Some(mode) = conf.section(Some("Backend")).and_then(|s| s.get("mode")) {
        settings.backend_mode = BackendMode::from_str_or_default(mode);
        debug!("Backend mode: {:?}", settings.backend_mode);
    }

    settings
}

/// `[start, end)` of the configured aperture.
pub fn aperture_range(settings: &GemSettings) -> Result<(u64, u64), SettingsError> {
    let start = settings.aperture_start;
    let size = settings.aperture_size;
    start
        .checked_add(size)
        .map(|end| (start, end))
        .ok_or(SettingsError::ApertureOverflow { start, size })
}

struct Section<'a> {
    name: &'static str,
    props: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, props: &'a Properties) -> Self {
        Self { name, props }
    }

    fn value<T>(&self, key: &'static str, parse: fn(&str) -> Result<T, String>) -> Option<T> {
        let raw = self.props.get(key)?;
        match parse(raw.trim()) {
            Ok(v) => Some(v),
            Err(reason) => {
                let e = SettingsError::InvalidValue {
                    section: self.name,
                    key,
                    value: raw.to_string(),
                    reason,
                };
                warn!("{e}; keeping default");
                None
            }
        }
    }

    fn apply<T>(&self, key: &'static str, slot: &mut T, parse: fn(&str) -> Result<T, String>) {
        if let Some(v) = self.value(key, parse) {
            *slot = v;
        }
    }
}

fn parse_number<T: FromStr>(s: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| e.to_string())
}

/// Decimal or `0x` hex, page aligned.
fn parse_address(s: &str) -> Result<u64, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| e.to_string())?,
        None => s.parse().map_err(|e: std::num::ParseIntError| e.to_string())?,
    };
    if !aperture_common::is_page_aligned(value) {
        return Err("not page aligned".to_string());
    }
    Ok(value)
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    parse_number::<u64>(s).map(Duration::from_millis)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            "[Aperture]\n\
             start = 0x100000\n\
             size = 16777216\n\
             max_eviction_attempts = 32\n\
             pinned_page_limit = 512\n\
             [Fence]\n\
             poll_interval_ms = 5\n\
             retire_interval_ms = 250\n\
             idle_timeout_ms = 2000\n\
             background_retire = true\n\
             [Debugging]\n\
             verify_lists = 1\n\
             sampler_always_flushed = yes\n\
             [Backend]\n\
             mode = immediate\n",
        );
        let s = load_from_file(file.path()).unwrap();
        assert_eq!(s.aperture_start, 0x10_0000);
        assert_eq!(s.aperture_size, 16 * 1024 * 1024);
        assert_eq!(s.max_eviction_attempts, 32);
        assert_eq!(s.pinned_page_limit, Some(512));
        assert_eq!(s.poll_interval, Duration::from_millis(5));
        assert_eq!(s.retire_interval, Duration::from_millis(250));
        assert_eq!(s.idle_timeout, Duration::from_secs(2));
        assert!(s.background_retire);
        assert!(s.verify_lists);
        assert!(s.sampler_always_flushed);
        assert_eq!(s.backend_mode, BackendMode::Immediate);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let file = write_config(
            "[Aperture]\n\
             start = 0x123\n\
             size = lots\n\
             pinned_page_limit = 0\n\
             [Fence]\n\
             background_retire = maybe\n",
        );
        let s = load_from_file(file.path()).unwrap();
        let d = GemSettings::default();
        assert_eq!(s.aperture_start, d.aperture_start);
        assert_eq!(s.aperture_size, d.aperture_size);
        assert_eq!(s.pinned_page_limit, None);
        assert_eq!(s.background_retire, d.background_retire);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ini");
        assert!(matches!(load_from_file(&path), Err(SettingsError::NotFound(_))));
        let s = load_config(Some(path.as_path()));
        assert_eq!(s.aperture_size, GemSettings::default().aperture_size);
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let file = write_config("[Aperture\nstart = 0\n");
        assert!(matches!(
            load_from_file(file.path()),
            Err(SettingsError::Parse { .. })
        ));
        assert_eq!(load_config(Some(file.path())).max_eviction_attempts, 4096);
    }

    #[test]
    fn test_aperture_range_overflow() {
        let file = write_config(
            "[Aperture]\n\
             start = 0xFFFFFFFFFFFFF000\n\
             size = 0x2000\n",
        );
        let s = load_from_file(file.path()).unwrap();
        assert!(matches!(
            aperture_range(&s),
            Err(SettingsError::ApertureOverflow { size: 0x2000, .. })
        ));

        let s = GemSettings {
            aperture_start: 0x1000,
            aperture_size: 0x4000,
            ..Default::default()
        };
        assert_eq!(aperture_range(&s).unwrap(), (0x1000, 0x5000));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_address("0x2000"), Ok(0x2000));
        assert_eq!(parse_address("8192"), Ok(8192));
        assert!(parse_address("4097").is_err());
        assert_eq!(parse_bool("Off"), Ok(false));
        assert!(parse_millis("-1").is_err());
    }
}
