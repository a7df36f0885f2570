// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client-facing device.
//!
//! [`Device`] wraps [`GemState`] in the device lock and adds per-client
//! handle tables and throttling state. Every operation takes the lock for its
//! whole duration, waits included; only [`Device::interrupt_waiters`] runs
//! without it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use aperture_common::{GemError, GemSettings, GttOffset, Handle, Result, NO_SEQNO};

use crate::backend::RingBackend;
use crate::backing_store::ObjectMapping;
use crate::domain::Domains;
use crate::execbuffer::ExecBuffer;
use crate::gem::{GemState, GemStats};
use crate::handle_table::HandleTable;
use crate::lru::LruList;
use crate::object::{ObjectId, ObjectInfo};
use crate::retire::{RetireSchedule, RetireWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct ClientState {
    handles: HandleTable,
    /// Fence of the client's latest submission.
    last_seqno: u32,
    /// `last_seqno` as of the previous throttle call.
    last_throttle_seqno: u32,
}

struct DeviceState {
    gem: GemState,
    clients: HashMap<ClientId, ClientState>,
    next_client: u32,
}

impl DeviceState {
    fn client(&mut self, client: ClientId) -> Result<(&mut GemState, &mut ClientState)> {
        match self.clients.get_mut(&client) {
            Some(state) => Ok((&mut self.gem, state)),
            None => Err(GemError::invalid(format!("unknown {client}"))),
        }
    }

    fn lookup(&mut self, client: ClientId, handle: Handle) -> Result<(&mut GemState, ObjectId)> {
        let (gem, state) = self.client(client)?;
        let id = state.handles.get(handle)?;
        Ok((gem, id))
    }
}

struct Shared {
    state: Mutex<DeviceState>,
    backend: Arc<dyn RingBackend>,
}

pub struct Device {
    // Joined before `shared` is released.
    retire_worker: Option<RetireWorker>,
    shared: Arc<Shared>,
}

impl Device {
    pub fn new(settings: GemSettings, backend: Arc<dyn RingBackend>) -> Result<Self> {
        let background_retire = settings.background_retire;
        let retire_interval = settings.retire_interval;
        let mut gem = GemState::new(settings, backend.clone());

        let schedule = background_retire.then(|| Arc::new(RetireSchedule::new()));
        if let Some(schedule) = &schedule {
            gem.set_retire_schedule(schedule.clone());
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(DeviceState {
                gem,
                clients: HashMap::new(),
                next_client: 1,
            }),
            backend,
        });

        let retire_worker = match schedule {
            Some(schedule) => {
                let weak = Arc::downgrade(&shared);
                let tick_schedule = schedule.clone();
                Some(RetireWorker::spawn(schedule, retire_interval, move || {
                    retire_tick(&weak, &tick_schedule)
                })?)
            }
            None => None,
        };

        log::info!(
            "device created on {} backend (background retire {})",
            shared.backend.name(),
            if background_retire { "on" } else { "off" }
        );
        Ok(Self {
            retire_worker,
            shared,
        })
    }

    pub fn backend(&self) -> &Arc<dyn RingBackend> {
        &self.shared.backend
    }

    pub fn has_retire_worker(&self) -> bool {
        self.retire_worker.is_some()
    }

    // ---- Clients -----------------------------------------------------------

    pub fn open_client(&self) -> ClientId {
        let mut state = self.shared.state.lock();
        let client = ClientId(state.next_client);
        state.next_client += 1;
        state.clients.insert(client, ClientState::default());
        log::debug!("{client} opened");
        client
    }

    /// Close every handle of `client` and forget it.
    pub fn close_client(&self, client: ClientId) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(mut client_state) = state.clients.remove(&client) else {
            return Err(GemError::invalid(format!("unknown {client}")));
        };
        let ids = client_state.handles.drain();
        log::debug!("{client} closed with {} open handles", ids.len());
        for id in ids {
            state.gem.drop_handle(id);
        }
        Ok(())
    }

    // ---- Objects -----------------------------------------------------------

    pub fn init_aperture(&self, start: u64, end: u64) -> Result<()> {
        self.shared.state.lock().gem.init_aperture(start, end)
    }

    pub fn create_object(&self, client: ClientId, size: u64) -> Result<Handle> {
        let mut state = self.shared.state.lock();
        let (gem, client_state) = state.client(client)?;
        let id = gem.create_object(size)?;
        gem.add_handle(id);
        match client_state.handles.add(id) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                gem.drop_handle(id);
                Err(e)
            }
        }
    }

    pub fn close_handle(&self, client: ClientId, handle: Handle) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, client_state) = state.client(client)?;
        let id = client_state.handles.close(handle)?;
        gem.drop_handle(id);
        Ok(())
    }

    pub fn pread(&self, client: ClientId, handle: Handle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.pread(id, offset, buf)
    }

    pub fn pwrite(&self, client: ClientId, handle: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.pwrite(id, offset, data)
    }

    /// CPU mapping of `size` bytes at `offset`. The mapping outlives the
    /// handle.
    pub fn mmap(
        &self,
        client: ClientId,
        handle: Handle,
        offset: u64,
        size: u64,
    ) -> Result<ObjectMapping> {
        let len = usize::try_from(size)
            .map_err(|_| GemError::invalid(format!("mapping size {size:#X} too large")))?;
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.mmap(id, offset, len)
    }

    pub fn set_domain(
        &self,
        client: ClientId,
        handle: Handle,
        read_domains: Domains,
        write_domain: Domains,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.set_domain(id, read_domains, write_domain)
    }

    pub fn sw_finish(&self, client: ClientId, handle: Handle) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.sw_finish(id);
        Ok(())
    }

    /// Pin into the aperture and return the offset.
    pub fn pin(&self, client: ClientId, handle: Handle, alignment: u64) -> Result<GttOffset> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.pin_for_client(id, alignment)
    }

    pub fn unpin(&self, client: ClientId, handle: Handle) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        if gem.object(id).is_some_and(|o| !o.is_pinned()) {
            log::warn!("{client}: unpin of unpinned handle {handle}");
            return Err(GemError::invalid(format!("handle {handle} is not pinned")));
        }
        gem.unpin(id);
        Ok(())
    }

    /// Whether the device still references the object. Retires completed
    /// work first.
    pub fn busy(&self, client: ClientId, handle: Handle) -> Result<bool> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.retire_requests();
        Ok(gem.is_busy(id))
    }

    // ---- Submission and fences --------------------------------------------

    pub fn execbuffer(&self, client: ClientId, exec: &mut ExecBuffer) -> Result<u32> {
        let mut state = self.shared.state.lock();
        let (gem, client_state) = state.client(client)?;
        let seqno = gem.execbuffer(&client_state.handles, exec)?;
        client_state.last_seqno = seqno;
        Ok(seqno)
    }

    /// Wait for the fence remembered at the previous throttle call, keeping
    /// the client at most one throttle interval ahead of the device.
    pub fn throttle(&self, client: ClientId) -> Result<()> {
        let mut state = self.shared.state.lock();
        let (gem, client_state) = state.client(client)?;
        let seqno = client_state.last_throttle_seqno;
        client_state.last_throttle_seqno = client_state.last_seqno;
        if seqno != NO_SEQNO {
            gem.wait_request(seqno)?;
        }
        Ok(())
    }

    pub fn wait_fence(&self, seqno: u32) -> Result<()> {
        self.shared.state.lock().gem.wait_request(seqno)
    }

    pub fn current_seqno(&self) -> u32 {
        self.shared.backend.hws_seqno()
    }

    pub fn retire_requests(&self) {
        self.shared.state.lock().gem.retire_requests();
    }

    /// Abort the fence waits in progress with [`GemError::Interrupted`].
    /// Returns false, and has no effect, when nobody is waiting.
    pub fn interrupt_waiters(&self) -> bool {
        let hit = self.shared.backend.irq_queue().interrupt();
        if !hit {
            log::debug!("interrupt with no fence waiter");
        }
        hit
    }

    // ---- Suspend / resume --------------------------------------------------

    pub fn idle(&self) -> Result<()> {
        self.shared.state.lock().gem.idle()
    }

    pub fn resume(&self) {
        self.shared.state.lock().gem.resume();
    }

    /// Last client gone: quiesce the device.
    pub fn lastclose(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.gem.is_suspended() {
            return Ok(());
        }
        state.gem.idle()
    }

    // ---- Introspection -----------------------------------------------------

    pub fn stats(&self) -> GemStats {
        self.shared.state.lock().gem.stats()
    }

    pub fn object_info(&self, client: ClientId, handle: Handle) -> Result<ObjectInfo> {
        let mut state = self.shared.state.lock();
        let (gem, id) = state.lookup(client, handle)?;
        gem.object_info(id).ok_or(GemError::UnknownHandle(handle))
    }

    pub fn lru_snapshot(&self, list: LruList) -> Vec<ObjectId> {
        self.shared.state.lock().gem.lru_snapshot(list)
    }

    pub fn verify_lists(&self) {
        self.shared.state.lock().gem.verify_lists();
    }
}

fn retire_tick(shared: &Weak<Shared>, schedule: &RetireSchedule) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.state.lock();
    state.gem.retire_requests();
    if state.gem.outstanding_requests() == 0 {
        schedule.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftBackend;
    use crate::execbuffer::{ExecObject, Relocation};
    use aperture_common::settings::BackendMode;
    use aperture_common::PAGE_SIZE_U64;
    use std::thread;
    use std::time::{Duration, Instant};

    const PAGE: u64 = PAGE_SIZE_U64;

    fn device_with(settings: GemSettings, pages: u64) -> (Device, Arc<SoftBackend>) {
        let backend = Arc::new(SoftBackend::new(settings.backend_mode));
        let device = Device::new(settings, backend.clone()).unwrap();
        // Start past zero so no batch can land at address 0.
        device.init_aperture(PAGE, PAGE * (pages + 1)).unwrap();
        (device, backend)
    }

    fn device(mode: BackendMode, pages: u64) -> (Device, Arc<SoftBackend>) {
        let settings = GemSettings {
            backend_mode: mode,
            verify_lists: true,
            ..Default::default()
        };
        device_with(settings, pages)
    }

    fn render_submission(target: Handle, batch: Handle) -> ExecBuffer {
        ExecBuffer {
            objects: vec![
                ExecObject::new(target),
                ExecObject::with_relocs(
                    batch,
                    vec![Relocation {
                        target_handle: target,
                        offset: 0,
                        delta: 0,
                        read_domains: Domains::RENDER,
                        write_domain: Domains::RENDER,
                        presumed_offset: 0,
                    }],
                ),
            ],
            batch_start_offset: 0,
            batch_len: 32,
            cliprects: Vec::new(),
        }
    }

    #[test]
    fn test_full_aperture_evicts_idle_object() {
        let (dev, _) = device(BackendMode::Immediate, 2);
        let client = dev.open_client();
        let a = dev.create_object(client, 4096).unwrap();
        let b = dev.create_object(client, 4096).unwrap();
        let c = dev.create_object(client, 4096).unwrap();

        dev.pin(client, a, 0).unwrap();
        dev.unpin(client, a).unwrap();
        dev.pin(client, b, 0).unwrap();
        dev.unpin(client, b).unwrap();
        assert_eq!(dev.stats().gtt_free, 0);

        dev.pin(client, c, 0).unwrap();
        let evicted = [a, b]
            .iter()
            .filter(|&&h| dev.object_info(client, h).unwrap().gtt_offset.is_none())
            .count();
        assert_eq!(evicted, 1);
        // Least recently used goes first.
        assert!(dev.object_info(client, a).unwrap().gtt_offset.is_none());
        assert!(dev.object_info(client, c).unwrap().gtt_offset.is_some());
    }

    #[test]
    fn test_render_write_then_wait() {
        let (dev, _) = device(BackendMode::Deferred, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();

        let seqno = dev
            .execbuffer(client, &mut render_submission(target, batch))
            .unwrap();
        let info = dev.object_info(client, target).unwrap();
        assert_eq!(info.list, Some(LruList::Active));
        assert_eq!(info.last_rendering_seqno, seqno);
        assert!(dev.busy(client, target).unwrap());

        dev.wait_fence(seqno).unwrap();
        let info = dev.object_info(client, target).unwrap();
        assert_ne!(info.list, Some(LruList::Active));
        assert_eq!(info.list, Some(LruList::Flushing));
        assert!(!dev.lru_snapshot(LruList::Active).contains(&info.id));
    }

    #[test]
    fn test_unpin_balance() {
        let (dev, _) = device(BackendMode::Immediate, 4);
        let client = dev.open_client();
        let h = dev.create_object(client, 4096).unwrap();
        assert!(matches!(dev.unpin(client, h), Err(GemError::InvalidArgument(_))));
        dev.pin(client, h, 0).unwrap();
        dev.unpin(client, h).unwrap();
        assert!(dev.unpin(client, h).is_err());
        assert_eq!(dev.object_info(client, h).unwrap().pin_count, 0);
    }

    #[test]
    fn test_pwrite_pread_through_device() {
        let (dev, _) = device(BackendMode::Immediate, 4);
        let client = dev.open_client();
        let h = dev.create_object(client, 100).unwrap();
        assert_eq!(dev.object_info(client, h).unwrap().size, PAGE);

        dev.pwrite(client, h, 10, b"aperture").unwrap();
        let mut buf = [0u8; 8];
        dev.pread(client, h, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"aperture");
        assert!(dev.pwrite(client, h, PAGE - 2, b"xyz").is_err());
        assert!(matches!(
            dev.pread(client, 77, 0, &mut buf),
            Err(GemError::UnknownHandle(77))
        ));
    }

    #[test]
    fn test_mmap_through_device() {
        let (dev, _) = device(BackendMode::Immediate, 4);
        let client = dev.open_client();
        let h = dev.create_object(client, PAGE).unwrap();
        dev.pwrite(client, h, 0, b"gtt").unwrap();

        let map = dev.mmap(client, h, 0, PAGE).unwrap();
        let mut buf = [0u8; 3];
        map.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"gtt");
        let info = dev.object_info(client, h).unwrap();
        assert_eq!(info.write_domain, Domains::CPU);

        dev.close_handle(client, h).unwrap();
        assert_eq!(dev.stats().object_count, 0);
        map.write(0, b"cpu").unwrap();
        assert!(dev.mmap(client, h, 0, PAGE).is_err());
    }

    #[test]
    fn test_handles_are_per_client() {
        let (dev, _) = device(BackendMode::Immediate, 4);
        let c1 = dev.open_client();
        let c2 = dev.open_client();
        let h = dev.create_object(c1, 4096).unwrap();
        assert_eq!(h, 1);
        assert!(dev.object_info(c2, h).is_err());

        dev.close_handle(c1, h).unwrap();
        assert!(dev.close_handle(c1, h).is_err());
        assert_eq!(dev.stats().object_count, 0);
    }

    #[test]
    fn test_close_client_releases_objects() {
        let (dev, backend) = device(BackendMode::Immediate, 4);
        let client = dev.open_client();
        let a = dev.create_object(client, 4096).unwrap();
        let _b = dev.create_object(client, 8192).unwrap();
        dev.pin(client, a, 0).unwrap();

        dev.close_client(client).unwrap();
        assert_eq!(dev.stats().object_count, 0);
        assert!(backend.bound_ranges().is_empty());
        assert!(dev.close_client(client).is_err());
        assert!(dev.create_object(client, 4096).is_err());
    }

    #[test]
    fn test_busy_object_outlives_handle() {
        let (dev, backend) = device(BackendMode::Stalled, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();

        dev.close_client(client).unwrap();
        assert_eq!(dev.stats().object_count, 2);

        backend.run_pending();
        dev.retire_requests();
        // The render target waits on the flushing list for its own flush.
        assert_eq!(dev.stats().object_count, 1);
        assert_eq!(dev.stats().flushing, 1);
    }

    #[test]
    fn test_throttle_waits_for_previous_submission() {
        let (dev, backend) = device(BackendMode::Deferred, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();

        let s1 = dev
            .execbuffer(client, &mut render_submission(target, batch))
            .unwrap();
        dev.throttle(client).unwrap();
        assert_eq!(backend.hws_seqno(), 0);

        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();
        dev.throttle(client).unwrap();
        assert!(crate::fence::seqno_passed(dev.current_seqno(), s1));
    }

    #[test]
    fn test_interrupt_waiters_aborts_wait() {
        let (dev, _) = device(BackendMode::Stalled, 8);
        let dev = Arc::new(dev);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        let seqno = dev
            .execbuffer(client, &mut render_submission(target, batch))
            .unwrap();

        let waiter = {
            let dev = dev.clone();
            thread::spawn(move || dev.wait_fence(seqno))
        };
        while !dev.interrupt_waiters() {
            thread::sleep(Duration::from_millis(5));
        }

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(GemError::Interrupted)));
        // The device is still usable and the wait can be restarted.
        assert!(dev.busy(client, target).unwrap());
    }

    #[test]
    fn test_interrupt_without_waiter_is_dropped() {
        let (dev, backend) = device(BackendMode::Stalled, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        let seqno = dev
            .execbuffer(client, &mut render_submission(target, batch))
            .unwrap();
        assert!(!dev.interrupt_waiters());

        let runner = {
            let backend = backend.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                backend.run_pending();
            })
        };
        dev.wait_fence(seqno).unwrap();
        runner.join().unwrap();
        assert!(!dev.busy(client, target).unwrap());
    }

    #[test]
    fn test_background_retire() {
        let settings = GemSettings {
            backend_mode: BackendMode::Immediate,
            background_retire: true,
            retire_interval: Duration::from_millis(5),
            verify_lists: true,
            ..Default::default()
        };
        let (dev, _) = device_with(settings, 8);
        assert!(dev.has_retire_worker());
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while dev.stats().outstanding_requests > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dev.stats().outstanding_requests, 0);
        assert!(dev.lru_snapshot(LruList::Active).is_empty());
    }

    #[test]
    fn test_idle_resume_and_lastclose() {
        let (dev, _) = device(BackendMode::Deferred, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();

        dev.lastclose().unwrap();
        let stats = dev.stats();
        assert_eq!(stats.gtt_count, 0);
        assert_eq!(stats.outstanding_requests, 0);
        assert!(matches!(
            dev.execbuffer(client, &mut render_submission(target, batch)),
            Err(GemError::Busy)
        ));
        // Already idle.
        dev.lastclose().unwrap();

        dev.resume();
        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();
    }

    #[test]
    fn test_idle_reports_wedged_device() {
        let settings = GemSettings {
            backend_mode: BackendMode::Stalled,
            idle_timeout: Duration::from_millis(30),
            idle_poll_quantum: Duration::from_millis(5),
            verify_lists: true,
            ..Default::default()
        };
        let (dev, _) = device_with(settings, 8);
        let client = dev.open_client();
        let target = dev.create_object(client, 4096).unwrap();
        let batch = dev.create_object(client, 4096).unwrap();
        dev.execbuffer(client, &mut render_submission(target, batch))
            .unwrap();

        let started = Instant::now();
        let err = dev.idle().unwrap_err();
        assert!(matches!(err, GemError::DeviceUnresponsive { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(dev.stats().gtt_count, 0);
    }
}
