//! Device buffer pool
//!
//! Maps the device's capture buffers once per streaming session and exports a
//! handle for each so hardware encoders can import them. Slots are addressed
//! by index everywhere else in the pipeline; [`SlotTable`] resolves an index
//! back to memory on the consuming side.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::device::{CaptureDevice, ExportHandle, SlotMemory};
use super::format::Format;
use crate::error::{CaptureError, Result};

/// One mapped device buffer
pub struct BufferSlot {
    index: u32,
    length: u32,
    memory: Arc<dyn SlotMemory>,
    export: ExportHandle,
}

impl BufferSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn export_handle(&self) -> &ExportHandle {
        &self.export
    }

    /// Whole mapped region
    pub fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    /// The first `bytes_used` bytes (the whole slot when 0)
    pub fn data(&self, bytes_used: u32) -> &[u8] {
        let memory = self.memory.as_slice();
        if bytes_used == 0 {
            return memory;
        }
        &memory[..(bytes_used as usize).min(memory.len())]
    }
}

/// Slots of an allocated pool plus the format they were mapped for
pub struct SlotTable {
    format: Format,
    slots: Vec<BufferSlot>,
}

impl SlotTable {
    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn get(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferSlot> {
        self.slots.iter()
    }
}

/// Fixed set of mapped, exported device buffers
pub struct BufferPool {
    device: Arc<dyn CaptureDevice>,
    table: Option<Arc<SlotTable>>,
}

impl BufferPool {
    /// Request, map and export `count` buffers.
    ///
    /// All or nothing: a shortfall or any failed export releases every buffer
    /// already obtained before the error is returned.
    pub fn allocate(device: Arc<dyn CaptureDevice>, format: Format, count: u32) -> Result<Self> {
        let mappings = device.request_buffers(count)?;
        let granted = mappings.len() as u32;

        let built = if granted < count {
            Err(CaptureError::BufferShortfall {
                requested: count,
                granted,
            })
        } else {
            mappings
                .into_iter()
                .map(|mapping| {
                    let export = device.export_buffer(mapping.index)?;
                    Ok(BufferSlot {
                        index: mapping.index,
                        length: mapping.length,
                        memory: mapping.memory,
                        export,
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        let slots = match built {
            Ok(slots) => slots,
            Err(e) => {
                warn!("Buffer pool allocation on {} failed: {}", device.name(), e);
                if let Err(release_err) = device.release_buffers() {
                    debug!("Releasing partial pool failed: {}", release_err);
                }
                return Err(e);
            }
        };

        info!(
            "Allocated {} capture buffers ({} bytes each) on {}",
            slots.len(),
            slots.first().map_or(0, |s| s.length),
            device.name()
        );

        Ok(Self {
            device,
            table: Some(Arc::new(SlotTable { format, slots })),
        })
    }

    /// Shared view of the slots; `None` once released
    pub fn table(&self) -> Option<Arc<SlotTable>> {
        self.table.clone()
    }

    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.table.is_none()
    }

    /// Unmap all slots and close their export handles. Releasing twice is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let Some(table) = self.table.take() else {
            return Ok(());
        };
        let outstanding = Arc::strong_count(&table) - 1;
        if outstanding > 0 {
            warn!(
                "Releasing buffer pool with {} outstanding slot imports",
                outstanding
            );
        }
        drop(table);
        self.device.release_buffers()?;
        debug!("Released buffer pool on {}", self.device.name());
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release buffer pool: {}", e);
        }
    }
}
