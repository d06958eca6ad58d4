//! # Routes
//!
//! A route addresses data on a mounted database:
//!
//! ```text
//! shop                 -> the whole tenant
//! shop/orders          -> one table (or route alias)
//! shop/orders/42       -> one row, by primary key
//! ```
//!
//! Routes arrive either in the `route` field of a message or as the URL path
//! the client connected to. Both forms are accepted with or without a leading
//! slash, and a query string is ignored.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::{Error, Result};

/// A parsed `{database}/{table}/{key}` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    segments: Vec<String>,
}

impl Route {
    /// Parses a route string.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRoute`] if there is no database segment.
    ///
    /// ```rust
    /// use qdb::Route;
    ///
    /// let route = Route::parse("/shop/orders/1").unwrap();
    /// assert_eq!(route.database(), "shop");
    /// assert_eq!(route.table(), Some("orders"));
    /// assert_eq!(route.key(), Some("1"));
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let path = raw.split(['?', '#']).next().unwrap_or("");
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.is_empty() {
            return Err(Error::InvalidRoute);
        }
        Ok(Self { segments })
    }

    /// Segment 0: the mount path of the tenant.
    pub fn database(&self) -> &str {
        &self.segments[0]
    }

    /// Segment 1, if present.
    pub fn table(&self) -> Option<&str> {
        self.segments.get(1).map(String::as_str)
    }

    /// Segment 2, if present.
    pub fn key(&self) -> Option<&str> {
        self.segments.get(2).map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segment-wise prefix test: `shop/orders` covers `shop/orders/1` but not
    /// `shop/orders_archive`.
    pub fn is_prefix_of(&self, other: &Route) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl Serialize for Route {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
