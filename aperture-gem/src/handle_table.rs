// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use aperture_common::{GemError, Handle, Result, INVALID_HANDLE};

use crate::object::ObjectId;

/// Maximum number of handles per client.
const MAX_HANDLES: usize = 1 << 16;

/// Per-client handle table: maps Handle -> ObjectId.
/// Handles are allocated starting from 1 (0 is invalid).
#[derive(Debug)]
pub struct HandleTable {
    objects: HashMap<Handle, ObjectId>,
    next_handle: Handle,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Add an object and return its handle.
    pub fn add(&mut self, id: ObjectId) -> Result<Handle> {
        if self.objects.len() >= MAX_HANDLES {
            return Err(GemError::OutOfMemory);
        }

        // Skip zero and handles still open after a wrap.
        let mut handle = self.next_handle;
        while handle == INVALID_HANDLE || self.objects.contains_key(&handle) {
            handle = handle.wrapping_add(1);
        }
        self.next_handle = handle.wrapping_add(1);

        self.objects.insert(handle, id);
        Ok(handle)
    }

    /// Look up an object by handle.
    pub fn get(&self, handle: Handle) -> Result<ObjectId> {
        self.objects
            .get(&handle)
            .copied()
            .ok_or(GemError::UnknownHandle(handle))
    }

    /// Remove a handle, returning the object it referred to.
    pub fn close(&mut self, handle: Handle) -> Result<ObjectId> {
        self.objects
            .remove(&handle)
            .ok_or(GemError::UnknownHandle(handle))
    }

    /// Remove every handle.
    pub fn drain(&mut self) -> Vec<ObjectId> {
        self.objects.drain().map(|(_, id)| id).collect()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
