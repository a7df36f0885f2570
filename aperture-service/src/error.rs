// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use aperture_common::error::errno;
use aperture_common::GemError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Gem(#[from] GemError),

    #[error("bad user address {addr:#X} (+{len:#X})")]
    Fault { addr: u64, len: usize },

    #[error("malformed argument record: {0}")]
    Record(#[from] std::io::Error),

    #[error("unknown ioctl {0:#X}")]
    UnknownIoctl(u32),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Gem(e) => e.errno(),
            Self::Fault { .. } => errno::EFAULT,
            Self::Record(_) | Self::UnknownIoctl(_) => errno::EINVAL,
        }
    }
}
