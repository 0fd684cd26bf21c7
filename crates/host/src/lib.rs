//! Spill host facade.
//!
//! This crate defines the trait the add-in talks to. Implementations wrap a
//! real document host; [`MemHost`] is the in-memory one used by tests and
//! the CLI.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use spill_core::{CellAddr, OwnedRange, RangeRef, SheetId};
use tracing::debug;

/// Identifier of a host-allocated temporary handed to a callback.
pub type TempId = u64;

/// A value as the host hands it to (or takes it from) a callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HostValue {
    /// Argument slot left empty by the document formula.
    Missing,
    Nil,
    Text(String),
    Number(f64),
    Bool(bool),
    Range(RangeRef),
    /// Row-major rectangular array.
    Array { rows: usize, cols: usize, values: Vec<HostValue> },
}

impl HostValue {
    pub fn as_range(&self) -> Option<&RangeRef> {
        match self {
            HostValue::Range(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, HostValue::Missing | HostValue::Nil)
    }
}

/// Registration metadata the host consumes for the add-in entry point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionSpec {
    pub export: String,
    pub name: String,
    pub arg_name: String,
    pub category: String,
    pub help: String,
    pub arg_help: String,
}

/// Host errors suitable for logging at the add-in boundary.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum HostError {
    #[error("no_caller: {0}")]
    NoCaller(String),
    #[error("coercion: {0}")]
    Coercion(String),
    #[error("resolve: {0}")]
    Resolve(String),
    #[error("mutation: {0}")]
    Mutation(String),
    #[error("registration: {0}")]
    Registration(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// A host temporary scoped to one callback. Releases itself on drop.
pub struct CallerRef<'h> {
    host: &'h dyn SheetHost,
    temp: TempId,
    value: HostValue,
}

impl<'h> CallerRef<'h> {
    pub fn new(host: &'h dyn SheetHost, temp: TempId, value: HostValue) -> Self {
        Self { host, temp, value }
    }

    pub fn value(&self) -> &HostValue {
        &self.value
    }
}

impl Drop for CallerRef<'_> {
    fn drop(&mut self) {
        self.host.release_temp(self.temp);
    }
}

/// The document host, as seen from the add-in.
///
/// Synchronous on purpose: the entry point is a synchronous callback and the
/// drain loop calls these between awaits. Implementations must be cheap to
/// call and must not re-enter the add-in.
pub trait SheetHost: Send + Sync {
    /// Location currently being evaluated, as a host temporary.
    fn calling_ref(&self) -> HostResult<CallerRef<'_>>;

    /// Render a scalar host value as the document would display it.
    fn coerce_text(&self, value: &HostValue) -> HostResult<String>;

    /// Whether the document can take structural changes right now.
    fn is_safe_to_mutate(&self) -> bool;

    /// Resolve a single-cell address offset down/right from the anchor's
    /// top-left cell.
    fn resolve_offset(
        &self,
        anchor: &OwnedRange,
        rows_down: u32,
        cols_right: u32,
    ) -> HostResult<CellAddr>;

    /// Render a formula string into a resolved cell.
    fn set_formula(&self, target: &CellAddr, formula: &str) -> HostResult<()>;

    /// Return a host temporary. Invoked by [`CallerRef`]'s drop.
    fn release_temp(&self, temp: TempId);

    /// Register the add-in's worksheet entry point.
    fn register_function(&self, spec: &FunctionSpec) -> HostResult<()>;
}

// ----------------- In-memory host -----------------

/// In-memory grid host for tests and the CLI.
///
/// Records every formula set, counts outstanding temporaries so callers can
/// assert balanced acquire/release, and fails `resolve_offset` outside the
/// configured grid bounds.
pub struct MemHost {
    rows: u32,
    cols: u32,
    caller: Mutex<Option<HostValue>>,
    safe: AtomicBool,
    cells: Mutex<FxHashMap<(SheetId, u32, u32), String>>,
    set_log: Mutex<Vec<(CellAddr, String)>>,
    temps_issued: AtomicU64,
    temps_open: AtomicI64,
    registered: Mutex<Vec<FunctionSpec>>,
}

impl MemHost {
    /// Bounds match the common document grid.
    pub fn new() -> Self {
        Self::with_bounds(1_048_576, 16_384)
    }

    pub fn with_bounds(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            caller: Mutex::new(None),
            safe: AtomicBool::new(true),
            cells: Mutex::new(FxHashMap::default()),
            set_log: Mutex::new(Vec::new()),
            temps_issued: AtomicU64::new(0),
            temps_open: AtomicI64::new(0),
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Configure the cell range the next callback appears to come from.
    pub fn set_caller(&self, range: RangeRef) {
        *self.caller.lock().unwrap() = Some(HostValue::Range(range));
    }

    /// Configure an arbitrary calling-context value (or none at all).
    pub fn set_caller_value(&self, value: Option<HostValue>) {
        *self.caller.lock().unwrap() = value;
    }

    pub fn set_safe(&self, safe: bool) {
        self.safe.store(safe, Ordering::SeqCst);
    }

    pub fn formula_at(&self, sheet: SheetId, row: u32, col: u32) -> Option<String> {
        self.cells.lock().unwrap().get(&(sheet, row, col)).cloned()
    }

    /// Every `set_formula` call observed, in call order.
    pub fn set_log(&self) -> Vec<(CellAddr, String)> {
        self.set_log.lock().unwrap().clone()
    }

    pub fn set_count(&self) -> usize {
        self.set_log.lock().unwrap().len()
    }

    /// Host temporaries acquired but not yet released.
    pub fn open_temps(&self) -> i64 {
        self.temps_open.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> Vec<FunctionSpec> {
        self.registered.lock().unwrap().clone()
    }
}

impl Default for MemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SheetHost for MemHost {
    fn calling_ref(&self) -> HostResult<CallerRef<'_>> {
        let value = self
            .caller
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| HostError::NoCaller("no evaluation in progress".into()))?;
        let temp = self.temps_issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.temps_open.fetch_add(1, Ordering::SeqCst);
        Ok(CallerRef::new(self, temp, value))
    }

    fn coerce_text(&self, value: &HostValue) -> HostResult<String> {
        match value {
            HostValue::Text(s) => Ok(s.clone()),
            HostValue::Number(n) => Ok(format!("{}", n)),
            HostValue::Bool(true) => Ok("TRUE".into()),
            HostValue::Bool(false) => Ok("FALSE".into()),
            HostValue::Missing | HostValue::Nil => {
                Err(HostError::Coercion("empty value".into()))
            }
            HostValue::Range(_) | HostValue::Array { .. } => {
                Err(HostError::Coercion("not a scalar".into()))
            }
        }
    }

    fn is_safe_to_mutate(&self) -> bool {
        self.safe.load(Ordering::SeqCst)
    }

    fn resolve_offset(
        &self,
        anchor: &OwnedRange,
        rows_down: u32,
        cols_right: u32,
    ) -> HostResult<CellAddr> {
        let a = anchor.anchor_cell();
        let row = a
            .row
            .checked_add(rows_down)
            .ok_or_else(|| HostError::Resolve("row overflow".into()))?;
        let col = a
            .col
            .checked_add(cols_right)
            .ok_or_else(|| HostError::Resolve("col overflow".into()))?;
        if row >= self.rows || col >= self.cols {
            return Err(HostError::Resolve(format!(
                "target ({}, {}) outside grid {}x{}",
                row, col, self.rows, self.cols
            )));
        }
        Ok(CellAddr { sheet: a.sheet, row, col })
    }

    fn set_formula(&self, target: &CellAddr, formula: &str) -> HostResult<()> {
        debug!(sheet = target.sheet, row = target.row, col = target.col, formula, "set formula");
        self.cells
            .lock()
            .unwrap()
            .insert((target.sheet, target.row, target.col), formula.to_string());
        self.set_log.lock().unwrap().push((*target, formula.to_string()));
        Ok(())
    }

    fn release_temp(&self, _temp: TempId) {
        self.temps_open.fetch_sub(1, Ordering::SeqCst);
    }

    fn register_function(&self, spec: &FunctionSpec) -> HostResult<()> {
        self.registered.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_text_renders_scalars() {
        let host = MemHost::new();
        assert_eq!(host.coerce_text(&HostValue::Text("EUR".into())).unwrap(), "EUR");
        assert_eq!(host.coerce_text(&HostValue::Number(7.0)).unwrap(), "7");
        assert_eq!(host.coerce_text(&HostValue::Number(1.5)).unwrap(), "1.5");
        assert_eq!(host.coerce_text(&HostValue::Bool(true)).unwrap(), "TRUE");
        assert!(host.coerce_text(&HostValue::Missing).is_err());
    }

    #[test]
    fn resolve_offset_respects_bounds() {
        let host = MemHost::with_bounds(10, 10);
        let anchor = OwnedRange::try_copy(&RangeRef::single(1, 5, 2)).unwrap();
        let ok = host.resolve_offset(&anchor, 3, 0).unwrap();
        assert_eq!(ok, CellAddr { sheet: 1, row: 8, col: 2 });
        assert!(host.resolve_offset(&anchor, 5, 0).is_err());
        assert!(host.resolve_offset(&anchor, 0, 8).is_err());
    }

    #[test]
    fn caller_guard_releases_temp_on_drop() {
        let host = MemHost::new();
        host.set_caller(RangeRef::single(1, 0, 0));
        {
            let guard = host.calling_ref().unwrap();
            assert!(guard.value().as_range().is_some());
            assert_eq!(host.open_temps(), 1);
        }
        assert_eq!(host.open_temps(), 0);
    }

    #[test]
    fn calling_ref_fails_outside_evaluation() {
        let host = MemHost::new();
        assert!(matches!(host.calling_ref(), Err(HostError::NoCaller(_))));
        assert_eq!(host.open_temps(), 0);
    }

    #[test]
    fn register_function_records_spec() {
        let host = MemHost::new();
        let spec = FunctionSpec {
            export: "SPILL".into(),
            name: "SPILL".into(),
            arg_name: "items".into(),
            category: "1".into(),
            help: "Materialize one formula row per item below this cell".into(),
            arg_help: "Optional: items (range/array/scalar)".into(),
        };
        host.register_function(&spec).unwrap();
        assert_eq!(host.registered(), vec![spec]);
    }
}
