// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod backend;
pub mod backing_store;
pub mod command;
pub mod device;
pub mod domain;
pub mod execbuffer;
pub mod fence;
pub mod gem;
pub mod handle_table;
pub mod lru;
pub mod object;
pub mod range_allocator;
pub mod retire;

pub use backend::{RingBackend, SoftBackend};
pub use backing_store::ObjectMapping;
pub use device::{ClientId, Device};
pub use domain::Domains;
pub use execbuffer::{ExecBuffer, ExecObject, Relocation};
pub use gem::{GemState, GemStats};
pub use lru::LruList;
pub use object::{ObjectId, ObjectInfo};
