// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global result type of all transactional operations.
pub type TxResult<T> = Result<T, TxError>;

/// Everything a transaction can fail with.
///
/// [`TxError::Conflict`] and [`TxError::RetrySignal`] are control signals:
/// they are caught and recovered by the transaction driver and only become
/// visible to user code that inspects the closure result itself. All other
/// variants escape [`atomically`](crate::atomically) unchanged.
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    /// A read snapshot went stale before the transaction could commit.
    /// The driver restarts the transaction.
    #[error("Transaction conflict")]
    Conflict,

    /// The transaction asked to be parked until one of its read variables
    /// changes. Raised by [`retry`](crate::retry()), handled by the driver.
    #[error("Transaction requested retry")]
    RetrySignal,

    /// The configured conflict limit was reached.
    #[error("Maximum number of conflicts reached ({0})")]
    MaxConflicts(usize),

    /// The configured retry limit was reached.
    #[error("Maximum number of retries reached ({0})")]
    MaxRetries(usize),

    /// A retry wait ran into its deadline before any read variable changed.
    #[error("Retry wait timed out")]
    RetryTimeout,

    /// An operation that must run outside of transactions was called from
    /// within one.
    #[error("Operation is not allowed inside a running transaction")]
    InAtomic,

    /// A type-erased payload did not hold the expected type.
    #[error("Transactional value has an unexpected type")]
    TypeConflict,

    /// The transaction was aborted by user code. Pending writes are
    /// discarded, on-fail hooks run, and the error propagates unchanged.
    #[error("Transaction aborted ({0})")]
    Aborted(String),
}
