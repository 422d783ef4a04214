//! GPU to host readback
//!
//! The append counter is the only value the host needs before it can size a draw or
//! a host mesh, so it gets its own small readback path with a blocking and a polled
//! variant.

use crate::constants::layout::COUNTER_STRIDE;
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{BufferId, BufferKind, ComputeDevice, CounterUnit, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Ready,
    /// Data taken or transfer cancelled
    Consumed,
}

/// An in-flight copy of a buffer range to host memory
#[derive(Debug)]
pub struct AsyncTransfer {
    id: TransferId,
    state: TransferState,
    data: Option<Vec<u8>>,
}

impl AsyncTransfer {
    pub fn begin<D: ComputeDevice + ?Sized>(
        device: &mut D,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> TerrainResult<Self> {
        let id = device.begin_transfer(buffer, offset, size)?;
        Ok(Self {
            id,
            state: TransferState::Pending,
            data: None,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == TransferState::Ready
    }

    /// Poll the device once; returns whether the data is now available
    pub fn update<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) -> TerrainResult<bool> {
        if self.state == TransferState::Pending && device.poll_transfer(self.id)? {
            self.data = Some(device.take_transfer(self.id)?);
            self.state = TransferState::Ready;
        }
        Ok(self.is_done())
    }

    /// Transfer contents; only present once done
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        let data = self.data.take();
        if data.is_some() {
            self.state = TransferState::Consumed;
        }
        data
    }

    pub fn cancel<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        if self.state == TransferState::Pending {
            device.cancel_transfer(self.id);
        }
        self.data = None;
        self.state = TransferState::Consumed;
    }
}

/// Async fetch of an append counter, already converted to vertices
#[derive(Debug)]
pub struct CounterTransfer {
    transfer: AsyncTransfer,
    unit: CounterUnit,
    vertex_count: Option<u64>,
}

impl CounterTransfer {
    pub fn is_done(&self) -> bool {
        self.vertex_count.is_some()
    }

    pub fn update<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) -> TerrainResult<bool> {
        if self.vertex_count.is_none() && self.transfer.update(device)? {
            let bytes = self.transfer.take_data().unwrap_or_default();
            self.vertex_count = Some(decode_counter(&bytes, self.unit)?);
        }
        Ok(self.is_done())
    }

    /// Vertex count; `None` until the transfer is done
    pub fn data(&self) -> Option<u64> {
        self.vertex_count
    }

    pub fn cancel<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        self.transfer.cancel(device);
    }
}

fn decode_counter(bytes: &[u8], unit: CounterUnit) -> TerrainResult<u64> {
    let word: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TerrainError::TransferFailed {
            reason: format!("counter readback returned {} bytes", bytes.len()),
        })?;
    Ok(u32::from_le_bytes(word) as u64 * unit.vertices_per_count())
}

/// Counter copied into a readback buffer, tagged with what the source append buffer counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterCopy {
    pub dest: BufferId,
    pub unit: CounterUnit,
}

/// Copies an append counter to a readback buffer and reports it in vertices
#[derive(Debug, Clone, Copy, Default)]
pub struct VertexCountReadback;

impl VertexCountReadback {
    pub fn new() -> Self {
        Self
    }

    /// Copy the counter of `source`; the unit comes from the buffer's declaration
    pub fn copy_counter<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        source: BufferId,
        dest: BufferId,
    ) -> TerrainResult<CounterCopy> {
        let unit = match device.buffer_kind(source)? {
            BufferKind::Append { unit } => unit,
            kind => {
                return Err(TerrainError::TransferFailed {
                    reason: format!("counter source is a {:?} buffer, not an append buffer", kind),
                })
            }
        };
        device.copy_counter(source, dest)?;
        Ok(CounterCopy { dest, unit })
    }

    /// Blocking fetch; stalls until every submitted dispatch finished
    pub fn fetch<D: ComputeDevice + ?Sized>(&self, device: &mut D, copy: CounterCopy) -> TerrainResult<u64> {
        let bytes = device.read_buffer(copy.dest, 0, COUNTER_STRIDE)?;
        decode_counter(&bytes, copy.unit)
    }

    pub fn fetch_async<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        copy: CounterCopy,
    ) -> TerrainResult<CounterTransfer> {
        Ok(CounterTransfer {
            transfer: AsyncTransfer::begin(device, copy.dest, 0, COUNTER_STRIDE)?,
            unit: copy.unit,
            vertex_count: None,
        })
    }
}
