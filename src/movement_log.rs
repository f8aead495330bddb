//! Movement Log: append-only storage of committed stock changes.
//!
//! The log has no update or delete path. Corrections are new `ADJUSTMENT`
//! movements. Reads are newest-first and paginated with an opaque [`Cursor`]
//! that encodes the id of the last movement handed out; since ids only grow,
//! an issued cursor keeps addressing the same page while new movements land
//! at the head of the log.

use crate::error::LedgerError;
use crate::model::{MovementRecord, MovementType, ProductId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CURSOR_PREFIX: &str = "mv_";

/// Opaque pagination cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor(i64);

impl Cursor {
    pub(crate) fn after(movement_id: i64) -> Self {
        Self(movement_id)
    }

    /// Movements strictly older than this id belong to the next page
    pub(crate) fn before_id(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CURSOR_PREFIX}{:x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(CURSOR_PREFIX)
            .and_then(|hex| i64::from_str_radix(hex, 16).ok())
            .filter(|id| *id > 0)
            .map(Cursor)
            .ok_or_else(|| LedgerError::validation(format!("invalid cursor '{s}'")))
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One page request against the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    pub fn after(limit: usize, cursor: Cursor) -> Self {
        Self {
            limit,
            cursor: Some(cursor),
        }
    }
}

/// A newest-first page of movements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementPage {
    pub movements: Vec<MovementRecord>,
    /// Present when older movements remain
    pub next_cursor: Option<Cursor>,
}

/// Optional narrowing of a global history read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementFilter {
    pub product_id: Option<ProductId>,
    pub movement_type: Option<MovementType>,
}

impl MovementFilter {
    pub fn product(product_id: impl Into<ProductId>) -> Self {
        Self {
            product_id: Some(product_id.into()),
            movement_type: None,
        }
    }

    pub fn of_type(movement_type: MovementType) -> Self {
        Self {
            product_id: None,
            movement_type: Some(movement_type),
        }
    }

    pub fn matches(&self, movement: &MovementRecord) -> bool {
        self.product_id
            .as_ref()
            .map_or(true, |p| *p == movement.product_id)
            && self
                .movement_type
                .map_or(true, |t| t == movement.movement_type)
    }
}

/// Read side of the append-only movement storage
///
/// Movements are appended only by [`LedgerStore::commit`](crate::store::LedgerStore::commit),
/// together with the projection update they describe.
pub trait MovementLog: Send + Sync {
    /// Newest-first page of one product's movements
    fn list_by_product(
        &self,
        product_id: &ProductId,
        page: &PageRequest,
    ) -> Result<MovementPage, LedgerError>;

    /// Newest-first movements across all products
    fn list_recent(
        &self,
        limit: usize,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, LedgerError>;

    /// Complete history of one product, oldest first
    fn replay(&self, product_id: &ProductId) -> Result<Vec<MovementRecord>, LedgerError>;
}

/// Cut one page out of a newest-first sequence of movements
///
/// Backends that can stream their history newest-first share this so cursor
/// semantics stay identical across them.
pub(crate) fn paginate<'a, I>(newest_first: I, page: &PageRequest) -> MovementPage
where
    I: IntoIterator<Item = &'a MovementRecord>,
{
    let mut movements: Vec<MovementRecord> = newest_first
        .into_iter()
        .filter(|m| page.cursor.map_or(true, |c| m.id < c.before_id()))
        .take(page.limit.saturating_add(1))
        .cloned()
        .collect();
    let next_cursor = if movements.len() > page.limit {
        movements.truncate(page.limit);
        movements.last().map(|m| Cursor::after(m.id))
    } else {
        None
    };
    MovementPage {
        movements,
        next_cursor,
    }
}
