//! Panic recovery for command handlers running inside a worker.
//!
//! A panicking handler must not take the whole worker down: the panic is
//! captured, logged, and turned into an error reply for the caller.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Await a future, converting a panic inside it into `Error::Internal`.
pub async fn with_recovery<F, T>(future: F, operation: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            tracing::error!(operation, panic = %panic_msg, "handler panic recovered");
            Err(Error::internal(format!("Panic in {operation}: {panic_msg}")))
        }
    }
}

/// Extract the message of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_recovery_success() {
        let result = with_recovery(async { Result::Ok(42) }, "ok_handler").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_recovery_error_passes_through() {
        let result: Result<()> =
            with_recovery(async { Err(Error::validation("bad input")) }, "bad_handler").await;
        assert_eq!(result.unwrap_err().code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_with_recovery_panic() {
        let result: Result<()> = with_recovery(
            async {
                panic!("device exploded");
            },
            "serviceStart",
        )
        .await;

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Panic in serviceStart"));
        assert!(err_msg.contains("device exploded"));
    }

    #[test]
    fn test_panic_message_string_payload() {
        let payload = std::panic::catch_unwind(|| {
            panic!("{}", "formatted message");
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted message");
    }

    #[test]
    fn test_panic_message_opaque_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "Unknown panic (no message)");
    }
}
