//! Per-thread "last failed provider" diagnostic slot.
//!
//! Every failing dispatch call overwrites the calling thread's slot.
//! Successful calls never clear it, so the slot names the most recent
//! failure on this thread, which is not necessarily the most recent call.
//! Use [`take_last_failed_provider`] to read and reset it.

use std::cell::RefCell;

use crate::core::error::{NativeError, Result, ResultCode};
use crate::core::provider::{self, ProviderId, ProviderInner};

thread_local! {
    static LAST_FAILED: RefCell<Option<FailedProvider>> = const { RefCell::new(None) };
}

/// Non-owning record of the provider whose call failed last on this thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedProvider {
    id: ProviderId,
    name: String,
    code: ResultCode,
}

impl FailedProvider {
    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Result code of the failing call.
    pub fn code(&self) -> ResultCode {
        self.code
    }

    /// Query the provider's native error.
    ///
    /// Fails with `InvalidState` when the provider has since been destroyed.
    pub fn last_native_error(&self) -> Result<NativeError> {
        let inner = provider::live(self.id)?;
        Ok(inner.backend().last_native_error())
    }
}

pub(crate) fn record(inner: &ProviderInner, code: ResultCode) {
    let failed = FailedProvider {
        id: inner.id(),
        name: inner.name().to_string(),
        code,
    };
    LAST_FAILED.with(|slot| {
        *slot.borrow_mut() = Some(failed);
    });
}

/// The provider whose call failed most recently on this thread.
pub fn last_failed_provider() -> Option<FailedProvider> {
    LAST_FAILED.with(|slot| slot.borrow().clone())
}

/// Read and clear this thread's slot.
pub fn take_last_failed_provider() -> Option<FailedProvider> {
    LAST_FAILED.with(|slot| slot.borrow_mut().take())
}
