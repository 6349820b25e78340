//! The common status vocabulary shared by device callbacks, the dispatch
//! engine and the guest-execution loop.

// ============================================================================
// Execution Tiers
// ============================================================================

/// The execution tier a virtual CPU executor is currently running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecTier {
    /// Limited context: may not block and may only call handlers that are
    /// marked valid for it.
    Constrained,
    /// Full host capability: any handler, any blocking lock.
    #[default]
    Capable,
}

impl ExecTier {
    /// Returns `true` for the constrained tier.
    #[inline]
    pub const fn is_constrained(self) -> bool {
        matches!(self, ExecTier::Constrained)
    }
}

// ============================================================================
// Guest Faults
// ============================================================================

/// Kind of architectural exception to deliver to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `#GP`, the I/O permission check failure.
    GeneralProtection,
    /// `#PF`, e.g. while reading the task-state segment.
    PageFault,
    /// `#SS`
    StackFault,
    /// Any other exception vector.
    Vector(u8),
}

impl FaultKind {
    /// The x86 exception vector number.
    pub const fn vector(&self) -> u8 {
        match self {
            FaultKind::GeneralProtection => 13,
            FaultKind::PageFault => 14,
            FaultKind::StackFault => 12,
            FaultKind::Vector(v) => *v,
        }
    }
}

/// A guest-visible exception together with its error code, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFault {
    /// The exception kind.
    pub kind: FaultKind,
    /// The error code pushed by the exception, if the vector has one.
    pub error_code: Option<u32>,
}

impl GuestFault {
    /// `#GP(0)`.
    pub const fn gp0() -> Self {
        Self {
            kind: FaultKind::GeneralProtection,
            error_code: Some(0),
        }
    }

    /// A fault of `kind` with the given error code.
    pub const fn with_code(kind: FaultKind, error_code: u32) -> Self {
        Self {
            kind,
            error_code: Some(error_code),
        }
    }
}

/// Sink that delivers exceptions to the guest.
///
/// Implemented by the vCPU layer; the engine never decides how delivery
/// happens, only that it must.
pub trait GuestFaultSink {
    /// Queue `fault` for injection before the guest resumes.
    fn raise_fault(&mut self, fault: GuestFault);
}

// ============================================================================
// Callback Status
// ============================================================================

/// Non-success outcome of a device callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The device has nothing at this sub-address. Reads are filled with
    /// all ones, writes are dropped.
    Unused,
    /// The callback cannot complete in this tier; replay it in the capable
    /// tier.
    DeferToCapableTier,
    /// The access raises a guest exception.
    Fault(GuestFault),
}

/// Result type returned by device callbacks.
pub type IoResult<T = ()> = Result<T, IoStatus>;

// ============================================================================
// Dispatch Result
// ============================================================================

/// Outcome of one dispatch operation.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult<T = ()> {
    /// The access completed.
    Success(T),
    /// Nothing is mapped at the address. Resolved inside the engine and
    /// never returned from the public read/write entry points.
    Unhandled,
    /// Replay the identical operation in the capable tier.
    DeferToCapableTier,
    /// Deliver this exception to the guest.
    Fault(GuestFault),
}

impl<T> DispatchResult<T> {
    /// Returns `true` if the operation completed.
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Success(_))
    }

    /// Returns `true` if the caller must switch tiers and replay.
    #[inline]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, DispatchResult::DeferToCapableTier)
    }

    /// The success value, if any.
    pub fn success(self) -> Option<T> {
        match self {
            DispatchResult::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Maps the success value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> DispatchResult<U> {
        match self {
            DispatchResult::Success(v) => DispatchResult::Success(f(v)),
            DispatchResult::Unhandled => DispatchResult::Unhandled,
            DispatchResult::DeferToCapableTier => DispatchResult::DeferToCapableTier,
            DispatchResult::Fault(fault) => DispatchResult::Fault(fault),
        }
    }

    /// Hands a fault outcome to `sink` and returns the result unchanged.
    ///
    /// This is the dispatch-to-guest translation step: a fault is never
    /// dropped on the way back to the guest-execution loop.
    pub fn inject_fault<S: GuestFaultSink + ?Sized>(self, sink: &mut S) -> Self {
        if let DispatchResult::Fault(fault) = self {
            sink.raise_fault(fault);
        }
        self
    }
}

impl<T> From<IoStatus> for DispatchResult<T> {
    fn from(status: IoStatus) -> Self {
        match status {
            IoStatus::Unused => DispatchResult::Unhandled,
            IoStatus::DeferToCapableTier => DispatchResult::DeferToCapableTier,
            IoStatus::Fault(fault) => DispatchResult::Fault(fault),
        }
    }
}

impl<T> From<IoResult<T>> for DispatchResult<T> {
    fn from(res: IoResult<T>) -> Self {
        match res {
            Ok(v) => DispatchResult::Success(v),
            Err(status) => status.into(),
        }
    }
}
