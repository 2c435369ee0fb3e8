//! Commands the host executes directly against device memory.

use std::sync::PoisonError;

use tiocl_shmem::{SharedMemory, TransportError};
use tracing::{debug, warn};

use crate::command::Command;
use crate::ClError;

fn transport_failed(err: TransportError) -> i32 {
    warn!(%err, "transfer failed");
    ClError::OutOfResources.code()
}

/// Runs a transfer, map, unmap, or native kernel. Launches and synchronization commands are not
/// host work and fail with `InvalidOperation`.
pub(crate) fn run_host(memory: &dyn SharedMemory, command: Command) -> Result<(), i32> {
    match command {
        Command::ReadBuffer { src, offset, dst } => {
            let mut bytes = vec![0u8; dst.len()];
            memory
                .read(src.device_addr() + offset, &mut bytes)
                .map_err(transport_failed)?;
            *dst.lock() = bytes;
            Ok(())
        }
        Command::WriteBuffer { dst, offset, data } => memory
            .write(dst.device_addr() + offset, &data)
            .map_err(transport_failed),
        Command::CopyBuffer {
            src,
            dst,
            src_offset,
            dst_offset,
            size,
        } => {
            let len = usize::try_from(size).map_err(|_| ClError::OutOfResources.code())?;
            memory
                .copy(src.device_addr() + src_offset, dst.device_addr() + dst_offset, len)
                .map_err(transport_failed)
        }
        Command::MapBuffer { mem, mapping } => {
            let len = usize::try_from(mapping.size).map_err(|_| ClError::MapFailure.code())?;
            let region = memory
                .map(
                    mem.device_addr() + mapping.offset,
                    len,
                    mapping.flags.transport_mode(),
                )
                .map_err(|err| {
                    warn!(%err, "map failed");
                    ClError::MapFailure.code()
                })?;
            *mapping.region.lock() = region.as_slice().to_vec();
            *mapping
                .transport
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(region);
            Ok(())
        }
        Command::UnmapMemObject { mem, mapping } => {
            let region = mapping
                .transport
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(mut region) = region else {
                debug!(map = mapping.id, "unmap of a mapping that never completed");
                return Err(ClError::InvalidValue.code());
            };
            if region.addr() != mem.device_addr() + mapping.offset {
                warn!(map = mapping.id, "mapping does not belong to this buffer");
                memory.unmap(region).map_err(transport_failed)?;
                return Err(ClError::InvalidValue.code());
            }
            if region.mode().writes() {
                let host = mapping.region.lock();
                let n = host.len().min(region.len());
                region.as_mut_slice()[..n].copy_from_slice(&host[..n]);
            }
            memory.unmap(region).map_err(transport_failed)
        }
        Command::NativeKernel { f, mems } => {
            let mut buffers = Vec::with_capacity(mems.len());
            for mem in &mems {
                let len = usize::try_from(mem.size()).map_err(|_| ClError::OutOfResources.code())?;
                let mut bytes = vec![0u8; len];
                memory
                    .read(mem.device_addr(), &mut bytes)
                    .map_err(transport_failed)?;
                buffers.push(bytes);
            }
            f(buffers.as_mut_slice())
                .map_err(|code| if code < 0 { code } else { ClError::OutOfResources.code() })?;
            for (mem, bytes) in mems.iter().zip(&buffers) {
                let n = bytes.len().min(mem.size() as usize);
                memory
                    .write(mem.device_addr(), &bytes[..n])
                    .map_err(transport_failed)?;
            }
            Ok(())
        }
        Command::NdRange(_)
        | Command::Task(_)
        | Command::Marker
        | Command::Barrier
        | Command::WaitForEvents => Err(ClError::InvalidOperation.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{HostRegion, Mapping};
    use crate::context::Context;
    use crate::flags::{MapFlags, MemFlags};
    use crate::handle::HandleTable;
    use crate::memobj::{DeviceAllocation, MemObject};
    use std::sync::{Arc, Mutex};
    use tiocl_shmem::{DeviceMemory, Heap};

    struct Fixture {
        memory: DeviceMemory,
        heap: Arc<Mutex<Heap>>,
        ctx: crate::handle::ContextHandle,
        buf: Arc<MemObject>,
    }

    fn fixture() -> Fixture {
        let memory = DeviceMemory::new(0x1000, 0x1000).unwrap();
        let heap = Arc::new(Mutex::new(Heap::new(0x1000, 0x1000, 128).unwrap()));
        let contexts: HandleTable<Context> = HandleTable::new(ClError::InvalidContext);
        let ctx = contexts.insert(Arc::new(Context::new(Vec::new())));
        let storage = DeviceAllocation::new(&heap, 64).unwrap();
        let buf = Arc::new(MemObject::buffer(ctx, MemFlags::READ_WRITE, 64, storage));
        Fixture {
            memory,
            heap,
            ctx,
            buf,
        }
    }

    fn mapping(flags: MapFlags, offset: u64, size: u64) -> Arc<Mapping> {
        Arc::new(Mapping {
            id: 1,
            offset,
            size,
            flags,
            region: HostRegion::default(),
            transport: Mutex::new(None),
        })
    }

    #[test]
    fn write_then_read() {
        let f = fixture();
        let write = Command::WriteBuffer {
            dst: Arc::clone(&f.buf),
            offset: 4,
            data: b"abcd".to_vec(),
        };
        run_host(&f.memory, write).unwrap();
        let dst = HostRegion::new(6);
        let read = Command::ReadBuffer {
            src: Arc::clone(&f.buf),
            offset: 3,
            dst: dst.clone(),
        };
        run_host(&f.memory, read).unwrap();
        assert_eq!(dst.to_vec(), b"\0abcd\0");
    }

    #[test]
    fn write_mapping_is_flushed_on_unmap() {
        let f = fixture();
        let map = mapping(MapFlags::WRITE, 8, 4);
        run_host(
            &f.memory,
            Command::MapBuffer {
                mem: Arc::clone(&f.buf),
                mapping: Arc::clone(&map),
            },
        )
        .unwrap();
        map.region.lock().copy_from_slice(b"wxyz");
        run_host(
            &f.memory,
            Command::UnmapMemObject {
                mem: Arc::clone(&f.buf),
                mapping: Arc::clone(&map),
            },
        )
        .unwrap();
        let mut back = [0u8; 4];
        f.memory.read(f.buf.device_addr() + 8, &mut back).unwrap();
        assert_eq!(&back, b"wxyz");
        assert_eq!(f.memory.outstanding_maps(), 0);
    }

    #[test]
    fn unmap_checks_the_owning_buffer() {
        let f = fixture();
        let storage = DeviceAllocation::new(&f.heap, 64).unwrap();
        let other = Arc::new(MemObject::buffer(f.ctx, MemFlags::READ_WRITE, 64, storage));
        let map = mapping(MapFlags::WRITE, 0, 4);
        run_host(
            &f.memory,
            Command::MapBuffer {
                mem: Arc::clone(&f.buf),
                mapping: Arc::clone(&map),
            },
        )
        .unwrap();
        map.region.lock().copy_from_slice(b"nope");
        let unmap = Command::UnmapMemObject {
            mem: Arc::clone(&other),
            mapping: Arc::clone(&map),
        };
        assert_eq!(run_host(&f.memory, unmap), Err(ClError::InvalidValue.code()));
        assert_eq!(f.memory.outstanding_maps(), 0);
        let mut back = [0u8; 4];
        f.memory.read(other.device_addr(), &mut back).unwrap();
        assert_eq!(back, [0; 4]);
    }

    #[test]
    fn native_kernels_see_and_update_buffer_copies() {
        let f = fixture();
        f.memory.write(f.buf.device_addr(), &[1, 2, 3]).unwrap();
        let native = Command::NativeKernel {
            f: Box::new(|bufs: &mut [Vec<u8>]| {
                for b in bufs[0].iter_mut() {
                    *b *= 2;
                }
                Ok(())
            }),
            mems: vec![Arc::clone(&f.buf)],
        };
        run_host(&f.memory, native).unwrap();
        let mut back = [0u8; 3];
        f.memory.read(f.buf.device_addr(), &mut back).unwrap();
        assert_eq!(back, [2, 4, 6]);

        let failing = Command::NativeKernel {
            f: Box::new(|_: &mut [Vec<u8>]| Err(7)),
            mems: Vec::new(),
        };
        assert_eq!(run_host(&f.memory, failing), Err(ClError::OutOfResources.code()));
    }

    #[test]
    fn launches_are_not_host_work() {
        let f = fixture();
        assert_eq!(
            run_host(&f.memory, Command::Marker),
            Err(ClError::InvalidOperation.code())
        );
    }
}
