//! Error taxonomy for the ABI boundary.
//!
//! Host functions hand the guest a flat `i32` result code; inside the crate
//! the same space is carried as [`WasmResult`]. Capability methods that can
//! fail return `Result<T, WasmError>` so the host-function layer can collapse
//! them to a code with `?`-free match arms. Construction and start failures
//! are a separate type because they surface to the embedder, not the guest.

use crate::constants::*;

/// Result-code space fixed by the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmResult {
    Ok,
    NotFound,
    BadArgument,
    SerializationFailure,
    ParseFailure,
    InvalidMemoryAccess,
    Empty,
    CasMismatch,
    InternalFailure,
    Unimplemented,
}

impl WasmResult {
    pub fn as_i32(self) -> i32 {
        match self {
            WasmResult::Ok => PROXY_RESULT_OK,
            WasmResult::NotFound => PROXY_RESULT_NOT_FOUND,
            WasmResult::BadArgument => PROXY_RESULT_BAD_ARGUMENT,
            WasmResult::SerializationFailure => PROXY_RESULT_SERIALIZATION_FAILURE,
            WasmResult::ParseFailure => PROXY_RESULT_PARSE_FAILURE,
            WasmResult::InvalidMemoryAccess => PROXY_RESULT_INVALID_MEMORY_ACCESS,
            WasmResult::Empty => PROXY_RESULT_EMPTY,
            WasmResult::CasMismatch => PROXY_RESULT_CAS_MISMATCH,
            WasmResult::InternalFailure => PROXY_RESULT_INTERNAL_FAILURE,
            WasmResult::Unimplemented => PROXY_RESULT_UNIMPLEMENTED,
        }
    }

    pub fn is_ok(self) -> bool {
        self == WasmResult::Ok
    }
}

/// A non-`Ok` result carried through capability signatures.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("wasm result: {result:?}")]
pub struct WasmError {
    result: WasmResult,
}

impl WasmError {
    pub fn new(result: WasmResult) -> Self {
        WasmError { result }
    }

    pub fn result(&self) -> WasmResult {
        self.result
    }

    /// The raw code handed back to the guest.
    pub fn code(&self) -> i32 {
        self.result.as_i32()
    }

    pub fn not_found() -> Self {
        WasmError::new(WasmResult::NotFound)
    }

    pub fn bad_argument() -> Self {
        WasmError::new(WasmResult::BadArgument)
    }

    pub fn invalid_memory_access() -> Self {
        WasmError::new(WasmResult::InvalidMemoryAccess)
    }

    pub fn internal_failure() -> Self {
        WasmError::new(WasmResult::InternalFailure)
    }

    pub fn unimplemented() -> Self {
        WasmError::new(WasmResult::Unimplemented)
    }
}

impl From<WasmResult> for WasmError {
    fn from(result: WasmResult) -> Self {
        WasmError::new(result)
    }
}

/// Collapses a capability result into the raw code for the ABI boundary.
pub fn result_code(res: Result<(), WasmError>) -> i32 {
    match res {
        Ok(()) => PROXY_RESULT_OK,
        Err(e) => e.code(),
    }
}

/// Failure while building or starting a plugin instance.
///
/// These never cross the guest boundary; they are returned to the embedder
/// when a plugin is constructed, so misconfiguration fails loud up front
/// instead of surfacing per request.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("proxy_on_vm_start failed")]
    VmStartRejected,
    #[error("proxy_on_configure failed")]
    ConfigureRejected,
    #[error("guest trap during startup: {0}")]
    Trap(#[source] anyhow::Error),
    #[error("instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_match_abi_values() {
        assert_eq!(WasmResult::Ok.as_i32(), 0);
        assert_eq!(WasmResult::NotFound.as_i32(), 1);
        assert_eq!(WasmResult::BadArgument.as_i32(), 2);
        assert_eq!(WasmResult::InvalidMemoryAccess.as_i32(), 6);
        assert_eq!(WasmResult::Empty.as_i32(), 7);
        assert_eq!(WasmResult::CasMismatch.as_i32(), 8);
        assert_eq!(WasmResult::InternalFailure.as_i32(), 10);
        assert_eq!(WasmResult::Unimplemented.as_i32(), 12);
    }

    #[test]
    fn error_carries_code() {
        let err = WasmError::new(WasmResult::CasMismatch);
        assert_eq!(err.code(), PROXY_RESULT_CAS_MISMATCH);
        assert_eq!(result_code(Err(err)), PROXY_RESULT_CAS_MISMATCH);
        assert_eq!(result_code(Ok(())), PROXY_RESULT_OK);
    }
}
