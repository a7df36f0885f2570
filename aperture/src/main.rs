// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use aperture_common::settings::BackendMode;
use aperture_common::PAGE_SIZE_U64;
use aperture_gem::{Device, SoftBackend};
use aperture_service::GemService;

use crate::workload::WorkloadParams;

/// aperture - graphics buffer-object manager
#[derive(Parser, Debug)]
#[command(
    name = "aperture",
    version,
    about = "Runs a synthetic rendering workload against the buffer manager"
)]
struct Args {
    /// Path to the INI config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of render targets
    #[arg(long, default_value_t = 16)]
    objects: usize,

    /// Size of each render target in bytes (rounded up to a page)
    #[arg(long, default_value_t = 64 * 1024)]
    object_size: u64,

    /// Number of batch submissions
    #[arg(long, default_value_t = 256)]
    submissions: usize,

    /// Aperture size in bytes, overriding the config file
    #[arg(long)]
    aperture_size: Option<u64>,

    /// Command processor mode, overriding the config file
    #[arg(long, value_parser = ["immediate", "deferred"])]
    mode: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("aperture - buffer-object manager");

    let mut settings = config::load_config(args.config.as_deref());
    if let Some(size) = args.aperture_size {
        settings.aperture_size = size
            .checked_next_multiple_of(PAGE_SIZE_U64)
            .with_context(|| format!("aperture size {size:#X} too large"))?;
    }
    if let Some(mode) = &args.mode {
        settings.backend_mode = BackendMode::from_str_or_default(mode);
    }
    let (start, end) = config::aperture_range(&settings)?;
    info!(
        "Aperture [{:#X}, {:#X}), backend {:?}",
        start, end, settings.backend_mode
    );

    let backend = Arc::new(SoftBackend::new(settings.backend_mode));
    let device = Device::new(settings, backend.clone()).context("Failed to create device")?;
    device
        .init_aperture(start, end)
        .context("Failed to initialize aperture")?;
    let service = GemService::new(Arc::new(device));

    let params = WorkloadParams {
        objects: args.objects,
        object_size: args.object_size,
        submissions: args.submissions,
    };
    let started = Instant::now();
    let report = workload::run(&service, &params).context("Workload failed")?;
    info!(
        "{} submissions ({} throttles, {} relocated targets) in {:.1?}",
        report.submissions,
        report.throttles,
        report.relocated,
        started.elapsed()
    );

    let device = service.device();
    device.lastclose().context("Failed to quiesce device")?;

    let stats = device.stats();
    info!(
        "Objects: {} ({} bound, {:#X} bytes), pinned {}",
        stats.object_count, stats.gtt_count, stats.gtt_memory, stats.pin_count
    );
    info!(
        "Aperture: {:#X} free of {:#X}; lists active={} flushing={} inactive={}",
        stats.gtt_free, stats.gtt_total, stats.active, stats.flushing, stats.inactive
    );
    info!(
        "Pages: {} clflushed, {} written back; {} dispatches, {} chipset flushes, seqno {}",
        stats.clflushed_pages,
        stats.writeback_pages,
        backend.dispatches().len(),
        backend.chipset_flush_count(),
        device.current_seqno()
    );

    Ok(())
}
