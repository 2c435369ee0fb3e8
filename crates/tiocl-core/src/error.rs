use thiserror::Error;

macro_rules! cl_errors {
    ($($variant:ident = $code:literal => $msg:tt,)*) => {
        /// Error returned by every API call. [`ClError::code`] is the status integer applications
        /// compare against.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
        pub enum ClError {
            $(
                #[error($msg)]
                $variant,
            )*
        }

        impl ClError {
            pub const ALL: &'static [ClError] = &[$(ClError::$variant,)*];

            pub const fn code(self) -> i32 {
                match self {
                    $(ClError::$variant => $code,)*
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(ClError::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

cl_errors! {
    DeviceNotFound = -1 => "device not found",
    DeviceNotAvailable = -2 => "device not available",
    CompilerNotAvailable = -3 => "compiler not available",
    MemObjectAllocationFailure = -4 => "memory object allocation failure",
    OutOfResources = -5 => "out of resources",
    OutOfHostMemory = -6 => "out of host memory",
    ProfilingInfoNotAvailable = -7 => "profiling info not available",
    MemCopyOverlap = -8 => "memory copy overlap",
    BuildProgramFailure = -11 => "build program failure",
    MapFailure = -12 => "map failure",
    MisalignedSubBufferOffset = -13 => "misaligned sub-buffer offset",
    ExecStatusErrorForEventsInWaitList = -14 => "execution status error for events in wait list",
    InvalidValue = -30 => "invalid value",
    InvalidDeviceType = -31 => "invalid device type",
    InvalidPlatform = -32 => "invalid platform",
    InvalidDevice = -33 => "invalid device",
    InvalidContext = -34 => "invalid context",
    InvalidQueueProperties = -35 => "invalid queue properties",
    InvalidCommandQueue = -36 => "invalid command queue",
    InvalidHostPtr = -37 => "invalid host pointer",
    InvalidMemObject = -38 => "invalid memory object",
    InvalidBinary = -42 => "invalid binary",
    InvalidBuildOptions = -43 => "invalid build options",
    InvalidProgram = -44 => "invalid program",
    InvalidProgramExecutable = -45 => "invalid program executable",
    InvalidKernelName = -46 => "invalid kernel name",
    InvalidKernelDefinition = -47 => "invalid kernel definition",
    InvalidKernel = -48 => "invalid kernel",
    InvalidArgIndex = -49 => "invalid argument index",
    InvalidArgValue = -50 => "invalid argument value",
    InvalidArgSize = -51 => "invalid argument size",
    InvalidKernelArgs = -52 => "invalid kernel arguments",
    InvalidWorkDimension = -53 => "invalid work dimension",
    InvalidWorkGroupSize = -54 => "invalid work group size",
    InvalidWorkItemSize = -55 => "invalid work item size",
    InvalidGlobalOffset = -56 => "invalid global offset",
    InvalidEventWaitList = -57 => "invalid event wait list",
    InvalidEvent = -58 => "invalid event",
    InvalidOperation = -59 => "invalid operation",
    InvalidBufferSize = -61 => "invalid buffer size",
    InvalidGlobalWorkSize = -63 => "invalid global work size",
    InvalidProperty = -64 => "invalid property",
    InvalidDevicePartitionCount = -68 => "invalid device partition count",
}

pub type ClResult<T> = Result<T, ClError>;

/// Human-readable description of any status integer, including execution states.
pub fn describe_status(code: i32) -> String {
    match code {
        0 => "complete".to_string(),
        1 => "running".to_string(),
        2 => "submitted".to_string(),
        3 => "queued".to_string(),
        _ => match ClError::from_code(code) {
            Some(err) => err.to_string(),
            None => format!("unknown status {code}"),
        },
    }
}
