//! Stream filters and filter changes.
//!
//! The feeder applies a `StreamFilter` to decide which tables are streamed
//! to a subscriber. The subscriber keeps a local mirror of the same filter
//! so that a reconnect resumes with every change the feeder has accepted.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Selects the tables streamed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFilter {
    /// Subscribed tables. `None` means every table.
    tables: Option<BTreeSet<String>>,
}

impl StreamFilter {
    /// Creates a filter that streams every table.
    pub fn all_tables() -> Self {
        Self { tables: None }
    }

    /// Creates a filter that streams only the given tables.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: Some(tables.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns true if every table is streamed.
    pub fn is_all_tables(&self) -> bool {
        self.tables.is_none()
    }

    /// Returns true if the given table is streamed.
    pub fn matches_table(&self, table: &str) -> bool {
        match &self.tables {
            None => true,
            Some(tables) => tables.contains(table),
        }
    }

    /// Returns the subscribed table names, or `None` for all tables.
    pub fn table_names(&self) -> Option<impl Iterator<Item = &str>> {
        self.tables.as_ref().map(|t| t.iter().map(String::as_str))
    }

    /// Applies a change accepted by the feeder to this filter.
    ///
    /// Fails without modifying the filter if the change does not make
    /// sense against the current subscription.
    pub fn apply(&mut self, change: &FilterChange) -> ProtocolResult<()> {
        let reject = |reason: &str| ProtocolError::InvalidFilterChange {
            request_id: change.request_id.clone(),
            reason: reason.to_string(),
        };

        let tables = self
            .tables
            .as_mut()
            .ok_or_else(|| reject("subscription streams all tables"))?;

        match &change.operation {
            FilterOperation::AddTable(table) => {
                if !tables.insert(table.clone()) {
                    return Err(reject("table is already subscribed"));
                }
            }
            FilterOperation::RemoveTable(table) => {
                if !tables.contains(table) {
                    return Err(reject("table is not subscribed"));
                }
                if tables.len() == 1 {
                    return Err(reject("cannot remove the last subscribed table"));
                }
                tables.remove(table);
            }
        }
        Ok(())
    }
}

/// The change requested by a `FilterChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperation {
    /// Start streaming a table.
    AddTable(String),
    /// Stop streaming a table.
    RemoveTable(String),
}

/// A consumer-requested change to a live subscription's filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChange {
    /// Caller-chosen unique request ID.
    pub request_id: String,
    /// Requested change.
    pub operation: FilterOperation,
}

impl FilterChange {
    /// Creates a request to add a table.
    pub fn add_table(request_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            operation: FilterOperation::AddTable(table.into()),
        }
    }

    /// Creates a request to remove a table.
    pub fn remove_table(request_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            operation: FilterOperation::RemoveTable(table.into()),
        }
    }
}

/// Outcome reported by the feeder for a filter change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChangeStatus {
    /// The change was applied at the feeder.
    Ok,
    /// The change had no effect (e.g. nothing to change).
    NotApplicable,
    /// The feeder failed to apply the change.
    Fail,
}

impl FilterChangeStatus {
    /// Converts to the wire code.
    pub fn to_code(&self) -> u8 {
        match self {
            FilterChangeStatus::Ok => 1,
            FilterChangeStatus::NotApplicable => 2,
            FilterChangeStatus::Fail => 3,
        }
    }

    /// Converts from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FilterChangeStatus::Ok),
            2 => Some(FilterChangeStatus::NotApplicable),
            3 => Some(FilterChangeStatus::Fail),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn all_tables_matches_everything() {
        let filter = StreamFilter::all_tables();
        assert!(filter.is_all_tables());
        assert!(filter.matches_table("users"));
        assert!(filter.table_names().is_none());
    }

    #[test]
    fn add_and_remove_tables() {
        let mut filter = StreamFilter::tables(["users"]);

        filter.apply(&FilterChange::add_table("r1", "orders")).unwrap();
        assert!(filter.matches_table("orders"));

        filter.apply(&FilterChange::remove_table("r2", "users")).unwrap();
        assert!(!filter.matches_table("users"));
        assert_eq!(filter.table_names().unwrap().collect::<Vec<_>>(), vec!["orders"]);
    }

    #[test]
    fn rejected_changes_leave_filter_untouched() {
        let mut filter = StreamFilter::tables(["users"]);
        let before = filter.clone();

        assert!(filter.apply(&FilterChange::add_table("r1", "users")).is_err());
        assert!(filter.apply(&FilterChange::remove_table("r2", "orders")).is_err());
        assert!(filter.apply(&FilterChange::remove_table("r3", "users")).is_err());
        assert_eq!(filter, before);

        let mut all = StreamFilter::all_tables();
        let err = all.apply(&FilterChange::add_table("r4", "users")).unwrap_err();
        assert!(err.to_string().contains("r4"));
    }

    #[test]
    fn status_codes() {
        for status in [
            FilterChangeStatus::Ok,
            FilterChangeStatus::NotApplicable,
            FilterChangeStatus::Fail,
        ] {
            assert_eq!(FilterChangeStatus::from_code(status.to_code()), Some(status));
        }
        assert_eq!(FilterChangeStatus::from_code(0), None);
        assert_eq!(FilterChangeStatus::from_code(42), None);
    }

    proptest! {
        #[test]
        fn add_then_remove_restores_filter(name in "[a-z]{1,12}") {
            let mut filter = StreamFilter::tables(["__base"]);
            let before = filter.clone();
            filter.apply(&FilterChange::add_table("a", name.clone())).unwrap();
            filter.apply(&FilterChange::remove_table("b", name)).unwrap();
            prop_assert_eq!(filter, before);
        }
    }
}
