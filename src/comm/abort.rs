//! Abort-on-error wrapper for rank entry points
//!
//! A partial co-add is not self-consistent, so any unexpected failure on any
//! rank ends the whole job. [`abort_on_error`] reports where the failure
//! happened and issues the collective abort.

use super::Comm;
use crate::error::{ErrorCode, Result, StackError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Status every rank exits with after an abort
pub const ABORT_STATUS: i32 = 1;

/// Short string identifying this process: `<hostname>:<pid>`
pub fn node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Run an entry point; abort the whole job if it fails or panics.
///
/// Errors that are already the abort marker pass through untouched, so a
/// rank that was told to stop does not issue a second abort.
pub async fn abort_on_error<T, Fut>(comm: &Comm, name: &str, entry: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let failure = match AssertUnwindSafe(entry).catch_unwind().await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) if err.is_aborted() => return Err(err),
        Ok(Err(err)) => err,
        Err(panic) => StackError::Other {
            code: ErrorCode::OTHER_PANIC,
            message: panic_message(panic.as_ref()),
            source: None,
        },
    };

    report_failure(comm.rank(), name, &failure);
    comm.abort(ABORT_STATUS).await;
    Err(StackError::aborted(ABORT_STATUS))
}

fn report_failure(rank: usize, name: &str, failure: &StackError) {
    let node = node_id();
    eprintln!("{} on {} in {}: {}", failure.kind(), node, name, failure);
    eprintln!("{}", failure.developer_message());
    error!(
        rank,
        node = %node,
        entry = name,
        "Unhandled failure, aborting job: {}",
        failure
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
