// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic client driving the device through the ioctl layer.
//!
//! One batch buffer holds a relocation slot per render target. Submission `n`
//! renders into target `n % objects`, so with more target bytes than aperture
//! the run keeps evicting. Relocation records live in user memory for the
//! whole run and carry their presumed offsets from one submission to the
//! next.

use anyhow::{bail, Context, Result};
use log::{debug, info};

use aperture_common::{align_up, Handle, PAGE_SIZE_U64};
use aperture_gem::{ClientId, Domains};
use aperture_service::records::{
    CreateArgs, ExecBufferArgs, ExecObjectRecord, HandleArgs, Record, RelocationRecord, RwArgs,
};
use aperture_service::{GemIoctl, GemService, UserBuffer, UserMemory};

/// Submissions between throttle calls.
const THROTTLE_INTERVAL: usize = 8;

/// Bytes of batch preamble before the first relocation slot. Keeps the batch
/// start off address 0 even when the batch lands at the aperture base.
const BATCH_HEADER: u32 = 8;

#[derive(Debug, Clone)]
pub struct WorkloadParams {
    pub objects: usize,
    pub object_size: u64,
    pub submissions: usize,
}

#[derive(Debug, Default)]
pub struct WorkloadReport {
    pub submissions: usize,
    pub throttles: usize,
    /// Submissions whose target moved since the previous use.
    pub relocated: usize,
}

struct Client<'a> {
    service: &'a GemService,
    id: ClientId,
    mem: UserBuffer,
}

impl Client<'_> {
    fn call(&mut self, ioctl: GemIoctl, args: &mut [u8]) -> Result<()> {
        let rc = self.service.ioctl(self.id, ioctl.raw(), args, &mut self.mem);
        if rc != 0 {
            bail!("{ioctl:?} failed with errno {}", -rc);
        }
        Ok(())
    }

    fn create(&mut self, size: u64) -> Result<Handle> {
        let mut args = CreateArgs { size, handle: 0 }.to_bytes()?;
        self.call(GemIoctl::Create, &mut args)?;
        Ok(CreateArgs::decode(&args)?.handle)
    }

    fn pwrite(&mut self, handle: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let data_ptr = self.mem.push(data);
        let mut args = RwArgs {
            handle,
            offset,
            size: data.len() as u64,
            data_ptr,
        }
        .to_bytes()?;
        self.call(GemIoctl::Pwrite, &mut args)
    }

    fn close(&mut self, handle: Handle) -> Result<()> {
        let mut args = HandleArgs { handle, value: 0 }.to_bytes()?;
        self.call(GemIoctl::Close, &mut args)
    }
}

pub fn run(service: &GemService, params: &WorkloadParams) -> Result<WorkloadReport> {
    if params.objects == 0 {
        bail!("workload needs at least one object");
    }
    let device = service.device();
    let mut client = Client {
        service,
        id: device.open_client(),
        mem: UserBuffer::new(),
    };
    info!(
        "{}: {} objects of {:#X} bytes, {} submissions",
        client.id, params.objects, params.object_size, params.submissions
    );

    let targets = (0..params.objects)
        .map(|_| client.create(params.object_size))
        .collect::<Result<Vec<_>>>()
        .context("creating render targets")?;

    let slots_len = 8 * params.objects as u64;
    let batch_size = align_up(u64::from(BATCH_HEADER) + slots_len, PAGE_SIZE_U64);
    let batch = client.create(batch_size).context("creating batch buffer")?;
    client
        .pwrite(batch, 0, &vec![0; (u64::from(BATCH_HEADER) + slots_len) as usize])
        .context("clearing batch buffer")?;

    // One persistent relocation record per target.
    let relocs: Vec<u64> = targets
        .iter()
        .enumerate()
        .map(|(i, &target)| -> Result<u64> {
            let rec = RelocationRecord {
                target_handle: target,
                delta: 0,
                offset: u64::from(BATCH_HEADER) + 8 * i as u64,
                presumed_offset: u64::MAX,
                read_domains: Domains::RENDER.bits(),
                write_domain: Domains::RENDER.bits(),
            };
            Ok(client.mem.push(&rec.to_bytes()?))
        })
        .collect::<Result<_>>()?;

    let objects_ptr = client.mem.alloc(2 * ExecObjectRecord::SIZE);
    let mut report = WorkloadReport::default();
    let mut last_offset = vec![None; targets.len()];

    for n in 0..params.submissions {
        let slot = n % targets.len();
        let target_rec = ExecObjectRecord {
            handle: targets[slot],
            ..Default::default()
        };
        let batch_rec = ExecObjectRecord {
            handle: batch,
            relocation_count: 1,
            relocs_ptr: relocs[slot],
            ..Default::default()
        };
        client.mem.copy_to_user(objects_ptr, &target_rec.to_bytes()?)?;
        client
            .mem
            .copy_to_user(objects_ptr + ExecObjectRecord::SIZE as u64, &batch_rec.to_bytes()?)?;

        let mut args = ExecBufferArgs {
            buffers_ptr: objects_ptr,
            buffer_count: 2,
            batch_start_offset: BATCH_HEADER,
            batch_len: 8,
            ..Default::default()
        }
        .to_bytes()?;
        client
            .call(GemIoctl::Execbuffer, &mut args)
            .with_context(|| format!("submission {n}"))?;
        report.submissions += 1;

        let placed = ExecObjectRecord::decode(&client.mem.read(objects_ptr, ExecObjectRecord::SIZE)?)?;
        if last_offset[slot].is_some_and(|prev| prev != placed.offset) {
            report.relocated += 1;
        }
        debug!("submission {n}: target {} at {:#X}", targets[slot], placed.offset);
        last_offset[slot] = Some(placed.offset);

        if (n + 1) % THROTTLE_INTERVAL == 0 {
            client.call(GemIoctl::Throttle, &mut [])?;
            report.throttles += 1;
        }
    }

    client.call(GemIoctl::Throttle, &mut [])?;
    for handle in targets.into_iter().chain([batch]) {
        client.close(handle)?;
    }
    device
        .close_client(client.id)
        .context("closing workload client")?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_common::settings::BackendMode;
    use aperture_common::GemSettings;
    use aperture_gem::{Device, SoftBackend};
    use std::sync::Arc;

    fn service(mode: BackendMode, pages: u64) -> GemService {
        let settings = GemSettings {
            backend_mode: mode,
            verify_lists: true,
            ..Default::default()
        };
        let device = Device::new(settings, Arc::new(SoftBackend::new(mode))).unwrap();
        device.init_aperture(0, pages * PAGE_SIZE_U64).unwrap();
        GemService::new(Arc::new(device))
    }

    #[test]
    fn test_workload_fits_in_aperture() {
        let svc = service(BackendMode::Immediate, 64);
        let params = WorkloadParams {
            objects: 4,
            object_size: PAGE_SIZE_U64,
            submissions: 20,
        };
        let report = run(&svc, &params).unwrap();
        assert_eq!(report.submissions, 20);
        assert_eq!(report.throttles, 2);
        assert_eq!(report.relocated, 0);
        svc.device().idle().unwrap();
        assert_eq!(svc.device().stats().object_count, 0);
    }

    #[test]
    fn test_workload_thrashes_small_aperture() {
        let svc = service(BackendMode::Deferred, 4);
        let params = WorkloadParams {
            objects: 6,
            object_size: PAGE_SIZE_U64,
            submissions: 24,
        };
        let report = run(&svc, &params).unwrap();
        assert_eq!(report.submissions, 24);
        svc.device().idle().unwrap();
        let stats = svc.device().stats();
        assert_eq!(stats.object_count, 0);
        assert_eq!(stats.gtt_free, stats.gtt_total);
    }

    #[test]
    fn test_workload_needs_objects() {
        let svc = service(BackendMode::Immediate, 4);
        let params = WorkloadParams {
            objects: 0,
            object_size: PAGE_SIZE_U64,
            submissions: 1,
        };
        assert!(run(&svc, &params).is_err());
    }
}
