use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u64 {
        const OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0;
        const PROFILING_ENABLE = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceType: u64 {
        const DEFAULT = 1 << 0;
        const CPU = 1 << 1;
        const GPU = 1 << 2;
        const ACCELERATOR = 1 << 3;
        const CUSTOM = 1 << 4;
        const ALL = 0xFFFF_FFFF;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecCapabilities: u64 {
        const KERNEL = 1 << 0;
        const NATIVE_KERNEL = 1 << 1;
    }
}

impl MemFlags {
    pub const ACCESS: MemFlags = MemFlags::READ_WRITE
        .union(MemFlags::WRITE_ONLY)
        .union(MemFlags::READ_ONLY);
    pub const HOST_PTR: MemFlags = MemFlags::USE_HOST_PTR
        .union(MemFlags::ALLOC_HOST_PTR)
        .union(MemFlags::COPY_HOST_PTR);

    /// The access qualifier, defaulting to read/write when none was given.
    pub fn access(self) -> MemFlags {
        match self & MemFlags::ACCESS {
            a if a.is_empty() => MemFlags::READ_WRITE,
            a => a,
        }
    }
}

impl MapFlags {
    pub fn transport_mode(self) -> tiocl_shmem::MapMode {
        match (self.contains(MapFlags::READ), self.contains(MapFlags::WRITE)) {
            (_, false) => tiocl_shmem::MapMode::Read,
            (false, true) => tiocl_shmem::MapMode::Write,
            (true, true) => tiocl_shmem::MapMode::ReadWrite,
        }
    }
}
