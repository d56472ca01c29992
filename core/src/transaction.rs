//! Ambient transactions shared between application writes and the outbox.

use std::any::Any;
use thiserror::Error;

/// Errors raised by transaction providers.
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    /// A transaction could not be started.
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    /// Commit failed; the work is lost.
    #[error("failed to commit transaction: {0}")]
    Commit(String),

    /// Rollback failed.
    #[error("failed to roll back transaction: {0}")]
    Rollback(String),
}

/// An open unit of work.
///
/// Dropping a transaction without committing must discard its work.
pub trait Transaction: Send {
    /// Commit the work.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Commit`] if the store refused the commit.
    fn commit(self: Box<Self>) -> Result<(), TransactionError>;

    /// Discard the work.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Rollback`] if the store failed to roll back.
    fn rollback(self: Box<Self>) -> Result<(), TransactionError>;

    /// Concrete transaction, for stores that need their own handle type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens transactions.
pub trait TransactionProvider: Send + Sync {
    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Begin`] if no transaction could be opened.
    fn begin(&self) -> Result<Box<dyn Transaction>, TransactionError>;
}

/// Run `work` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// A panic inside `work` drops the transaction, which discards it.
///
/// # Errors
///
/// Returns the error from `work`, or a [`TransactionError`] (converted into
/// `E`) if the transaction could not be opened or committed.
pub fn with_transaction<T, E, F>(provider: &dyn TransactionProvider, work: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
    E: From<TransactionError>,
{
    let mut transaction = provider.begin()?;
    match work(transaction.as_mut()) {
        Ok(value) => {
            transaction.commit()?;
            Ok(value)
        },
        Err(err) => {
            if let Err(rollback) = transaction.rollback() {
                tracing::warn!(error = %rollback, "rollback failed after unit of work error");
            }
            Err(err)
        },
    }
}
