// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

/// Buffer manager settings, populated from the config INI.
#[derive(Debug, Clone)]
pub struct GemSettings {
    // Aperture
    pub aperture_start: u64,
    pub aperture_size: u64,
    pub max_eviction_attempts: u32,
    pub pinned_page_limit: Option<usize>,

    // Fence
    pub poll_interval: Duration,
    pub retire_interval: Duration,
    pub idle_timeout: Duration,
    pub idle_poll_quantum: Duration,
    pub background_retire: bool,

    // Hardware quirks
    pub sampler_always_flushed: bool,

    // Backend
    pub backend_mode: BackendMode,

    // Debug
    pub verify_lists: bool,
}

impl Default for GemSettings {
    fn default() -> Self {
        Self {
            aperture_start: 0,
            aperture_size: 256 * 1024 * 1024,
            max_eviction_attempts: 4096,
            pinned_page_limit: None,
            poll_interval: Duration::from_millis(10),
            retire_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            idle_poll_quantum: Duration::from_millis(10),
            background_retire: false,
            sampler_always_flushed: false,
            backend_mode: BackendMode::Deferred,
            verify_lists: cfg!(debug_assertions),
        }
    }
}

/// How the software command processor consumes the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Commands execute as soon as they are emitted.
    Immediate,
    /// Commands execute once a waiter enables the completion interrupt.
    Deferred,
    /// Commands only execute on explicit request (a wedged device).
    Stalled,
}

impl BackendMode {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "immediate" => Self::Immediate,
            "1" | "deferred" => Self::Deferred,
            "2" | "stalled" => Self::Stalled,
            _ => Self::Deferred,
        }
    }
}
