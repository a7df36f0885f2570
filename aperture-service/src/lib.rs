// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod error;
pub mod gem_ioctl;
pub mod records;
pub mod user_memory;

pub use error::{ServiceError, ServiceResult};
pub use gem_ioctl::{GemIoctl, GemService};
pub use user_memory::{UserBuffer, UserMemory};
